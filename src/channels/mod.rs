//! Front ends that drive a [`crate::chat::ChatSession`].

mod repl;

pub use self::repl::ReplChannel;
