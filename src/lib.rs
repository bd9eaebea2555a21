//! Tonpixo: chat session orchestration for a TON blockchain analysis
//! backend.
//!
//! A conversation moves through three stages. An address is bootstrapped
//! into an account summary and a scan-type prompt, a scan job is submitted
//! and polled until it finishes, and questions about the finished scan are
//! answered over a token stream. [`chat::ChatSession`] owns all three and
//! writes everything the user sees into a [`timeline::Timeline`].

pub mod backend;
pub mod bootstrap;
pub mod channels;
pub mod chat;
pub mod cli;
pub mod config;
pub mod error;
pub mod retry;
pub mod session;
pub mod settings;
pub mod timeline;

pub use chat::{ChatSession, ChatSettings, InputRoute};
pub use config::Config;
pub use error::Error;
pub use timeline::{Message, MessageContent, Role, Timeline, TimelineEvent};
