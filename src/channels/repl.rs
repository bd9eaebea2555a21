//! Interactive REPL with line editing and markdown rendering.
//!
//! Uses rustyline for line editing, history, and tab-completion, and
//! termimad for rendering agent answers inline. Output is driven entirely
//! by [`TimelineEvent`]s, so answers stream in while the prompt stays live.
//!
//! ## Commands
//!
//! - `/help` - Show available commands
//! - `/quit` or `/exit` - Exit the REPL
//! - `/new` - Start a new conversation
//! - `/scan <type>` - Scan transactions, jettons or NFTs for the current address
//! - `/cancel` - Stop the streaming answer, or the running scan
//! - `/status` - Show the current address and jobs

use std::borrow::Cow;
use std::collections::HashMap;
use std::io::{self, Write};

use rustyline::completion::Completer;
use rustyline::config::Config;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{CompletionType, Editor, Helper};
use termimad::MadSkin;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::backend::ScanType;
use crate::chat::{BootstrapSource, ChatSession};
use crate::timeline::{AccountDetails, Message, MessageContent, Role, TimelineEvent};

/// Slash commands available in the REPL.
const SLASH_COMMANDS: &[&str] = &[
    "/help",
    "/quit",
    "/exit",
    "/new",
    "/scan transactions",
    "/scan jettons",
    "/scan nfts",
    "/cancel",
    "/status",
];

/// Rustyline helper for slash-command tab completion.
struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        if !line.starts_with('/') {
            return Ok((0, vec![]));
        }

        let prefix = &line[..pos];
        let matches: Vec<String> = SLASH_COMMANDS
            .iter()
            .filter(|cmd| cmd.starts_with(prefix))
            .map(|cmd| cmd.to_string())
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for ReplHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if !line.starts_with('/') || pos < line.len() {
            return None;
        }

        SLASH_COMMANDS
            .iter()
            .find(|cmd| cmd.starts_with(line) && **cmd != line)
            .map(|cmd| cmd[line.len()..].to_string())
    }
}

impl Highlighter for ReplHelper {
    fn highlight_hint<'h>(&self, hint: &'h str) -> Cow<'h, str> {
        Cow::Owned(format!("\x1b[90m{hint}\x1b[0m"))
    }
}

impl Validator for ReplHelper {}
impl Helper for ReplHelper {}

/// Build a termimad skin with our color scheme.
fn make_skin() -> MadSkin {
    let mut skin = MadSkin::default();
    skin.set_headers_fg(termimad::crossterm::style::Color::Yellow);
    skin.bold.set_fg(termimad::crossterm::style::Color::White);
    skin.italic
        .set_fg(termimad::crossterm::style::Color::Magenta);
    skin.inline_code
        .set_fg(termimad::crossterm::style::Color::Green);
    skin.code_block
        .set_fg(termimad::crossterm::style::Color::Green);
    skin.code_block.left_margin = 2;
    skin
}

fn print_help() {
    let h = "\x1b[1m";
    let c = "\x1b[36m";
    let d = "\x1b[90m";
    let r = "\x1b[0m";

    println!();
    println!("  {h}Getting started{r}");
    println!("  {d}paste a TON address, pick a scan type, then ask questions{r}");
    println!();
    println!("  {h}Commands{r}");
    println!("  {c}/new{r}            {d}start a new conversation{r}");
    println!("  {c}/scan{r} {d}<type>{r}     {d}scan transactions, jettons or nfts{r}");
    println!("  {c}/cancel{r}         {d}stop the answer or scan in progress{r}");
    println!("  {c}/status{r}         {d}show the current address and jobs{r}");
    println!("  {c}/help{r}           {d}show this help{r}");
    println!("  {c}/quit{r}           {d}exit{r}");
    println!();
    println!("  {d}Ctrl+C cancels, Ctrl+D exits{r}");
    println!();
}

/// Get the history file path (~/.tonpixo/history).
fn history_path() -> std::path::PathBuf {
    crate::bootstrap::tonpixo_home().join("history")
}

fn terminal_width() -> usize {
    crossterm::terminal::size()
        .map(|(w, _)| w as usize)
        .unwrap_or(80)
}

fn print_separator() {
    let sep_width = terminal_width().min(80);
    eprintln!("\x1b[90m{}\x1b[0m", "\u{2500}".repeat(sep_width));
}

/// What the input thread hands to the session loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplInput {
    Line(String),
    Interrupt,
    Quit,
}

/// Locally handled command, parsed from a slash line.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    New,
    Scan(Option<ScanType>),
    Cancel,
    Status,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<ReplCommand> {
    let rest = line.strip_prefix('/')?;
    let mut parts = rest.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or_default().to_ascii_lowercase();
    let arg = parts.next().map(str::trim).unwrap_or_default();
    let command = match name.as_str() {
        "new" => ReplCommand::New,
        "scan" => ReplCommand::Scan(ScanType::parse(arg)),
        "cancel" | "interrupt" => ReplCommand::Cancel,
        "status" => ReplCommand::Status,
        _ => ReplCommand::Unknown(line.to_string()),
    };
    Some(command)
}

/// Prints timeline events as they arrive.
struct Renderer {
    skin: MadSkin,
    /// Bytes of `accumulated_text` already printed, per streaming message.
    streamed: HashMap<String, usize>,
    /// Last line typed at the prompt; its echo in the timeline is skipped.
    typed: Option<String>,
}

impl Renderer {
    fn new() -> Self {
        Self {
            skin: make_skin(),
            streamed: HashMap::new(),
            typed: None,
        }
    }

    fn render(&mut self, event: TimelineEvent) {
        match event {
            TimelineEvent::Appended(message) => self.appended(&message),
            TimelineEvent::Updated(message) => self.updated(&message),
            TimelineEvent::Removed { id } => {
                if self.streamed.remove(&id).is_some() {
                    println!();
                }
            }
            TimelineEvent::Cleared => {
                self.streamed.clear();
                eprintln!("\x1b[90mStarted a new conversation.\x1b[0m");
            }
        }
        let _ = io::stdout().flush();
    }

    fn appended(&mut self, message: &Message) {
        if message.streaming {
            print_separator();
            self.streamed.insert(message.id.clone(), 0);
            self.print_delta(message);
            return;
        }
        if message.transient {
            if let Some(text) = message.text() {
                eprintln!("  \x1b[90m\u{25CB} {text}\x1b[0m");
            }
            return;
        }

        match &message.content {
            MessageContent::Text { text } => match message.role {
                Role::User => {
                    if self.typed.as_deref() == Some(text.as_str()) {
                        self.typed = None;
                    } else {
                        println!("\x1b[1;36m\u{203A}\x1b[0m \x1b[90m{text}\x1b[0m");
                    }
                }
                Role::Agent => {
                    print_separator();
                    self.print_markdown(text);
                }
            },
            MessageContent::AccountDetails(details) => {
                print_separator();
                print_account(details);
            }
            MessageContent::ScanTypePrompt { address, options } => {
                println!("What should I scan for \x1b[1m{address}\x1b[0m?");
                for option in options {
                    println!(
                        "  \x1b[36m{}\x1b[0m  \x1b[90m/scan {}\x1b[0m",
                        option.label(),
                        option.as_str()
                    );
                }
                println!();
            }
        }
    }

    fn updated(&mut self, message: &Message) {
        if !self.streamed.contains_key(&message.id) {
            // Finalized before we saw it stream (e.g. after a lagged receiver).
            if !message.streaming {
                self.appended(message);
            }
            return;
        }

        self.print_delta(message);
        if message.streaming {
            return;
        }

        self.streamed.remove(&message.id);
        println!();
        // An error frame replaces the streamed text with the error message.
        if let Some(text) = message.content.as_text()
            && text != message.accumulated_text
        {
            eprintln!("\x1b[31m{text}\x1b[0m");
        }
        println!();
    }

    fn print_delta(&mut self, message: &Message) {
        let Some(printed) = self.streamed.get_mut(&message.id) else {
            return;
        };
        let text = &message.accumulated_text;
        if let Some(delta) = text.get(*printed..)
            && !delta.is_empty()
        {
            print!("{delta}");
        }
        *printed = text.len();
    }

    fn print_markdown(&self, text: &str) {
        let width = terminal_width();
        let rendered = termimad::FmtText::from(&self.skin, text, Some(width));
        print!("{rendered}");
        println!();
    }
}

fn print_account(details: &AccountDetails) {
    if details.error {
        eprintln!(
            "\x1b[31m\u{2717}\x1b[0m Couldn't load account details for \x1b[1m{}\x1b[0m",
            details.address
        );
        return;
    }

    println!("\x1b[1m{}\x1b[0m", details.address);
    if details.is_scam {
        println!("  \x1b[31mflagged as scam\x1b[0m");
    }
    let kind = if details.is_wallet { "wallet" } else { "contract" };
    match &details.status {
        Some(status) => println!("  \x1b[90mstatus\x1b[0m        {status} {kind}"),
        None => println!("  \x1b[90mtype\x1b[0m          {kind}"),
    }
    if let Some(balance) = &details.balance {
        println!("  \x1b[90mbalance\x1b[0m       {balance} TON");
    }
    if let Some(last_activity) = &details.last_activity {
        println!("  \x1b[90mlast activity\x1b[0m {last_activity}");
    }
    if !details.interfaces.is_empty() {
        println!(
            "  \x1b[90minterfaces\x1b[0m    {}",
            details.interfaces.join(", ")
        );
    }
    println!();
}

/// Line-editing front end for one [`ChatSession`].
pub struct ReplChannel {
    session: ChatSession,
    initial_address: Option<String>,
    suppress_banner: bool,
}

impl ReplChannel {
    pub fn new(session: ChatSession) -> Self {
        Self {
            session,
            initial_address: None,
            suppress_banner: false,
        }
    }

    /// Bootstrap `address` as soon as the REPL starts, as if navigated to.
    pub fn with_initial_address(mut self, address: Option<String>) -> Self {
        self.initial_address = address;
        self
    }

    pub fn suppress_banner(mut self) -> Self {
        self.suppress_banner = true;
        self
    }

    /// Run until the user quits. Background work is stopped on exit.
    pub async fn run(self) {
        let mut events = self.session.subscribe();
        let mut input = spawn_input_thread(self.suppress_banner);
        let mut renderer = Renderer::new();

        if let Some(address) = self.initial_address.clone() {
            let session = self.session.clone();
            tokio::spawn(async move {
                session
                    .handle_address_received(&address, BootstrapSource::Navigation)
                    .await;
            });
        }

        loop {
            tokio::select! {
                line = input.recv() => match line {
                    None | Some(ReplInput::Quit) => break,
                    Some(ReplInput::Interrupt) => self.cancel(),
                    Some(ReplInput::Line(line)) => self.dispatch(line, &mut renderer),
                },
                event = events.recv() => match event {
                    Ok(event) => renderer.render(event),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "REPL fell behind the conversation timeline");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.session.close();
    }

    fn dispatch(&self, line: String, renderer: &mut Renderer) {
        match parse_command(&line) {
            Some(ReplCommand::New) => self.session.reset(),
            Some(ReplCommand::Scan(Some(scan_type))) => {
                if self.session.address().is_none() {
                    eprintln!("\x1b[90mPaste a TON address first.\x1b[0m");
                } else {
                    self.session.select_scan_type(scan_type);
                }
            }
            Some(ReplCommand::Scan(None)) => {
                eprintln!("\x1b[90musage: /scan transactions|jettons|nfts\x1b[0m");
            }
            Some(ReplCommand::Cancel) => self.cancel(),
            Some(ReplCommand::Status) => self.print_status(),
            Some(ReplCommand::Unknown(command)) => {
                eprintln!("\x1b[90munknown command {command}, try /help\x1b[0m");
            }
            None => {
                renderer.typed = Some(line.clone());
                let session = self.session.clone();
                // Spawned so /cancel and rendering stay responsive.
                tokio::spawn(async move {
                    let route = session.handle_user_input(&line).await;
                    tracing::debug!(?route, "Input handled");
                });
            }
        }
    }

    fn cancel(&self) {
        if self.session.cancel_stream() || self.session.cancel_scan() {
            eprintln!("\x1b[90mcancelled\x1b[0m");
        } else {
            eprintln!("\x1b[90mnothing to cancel\x1b[0m");
        }
    }

    fn print_status(&self) {
        let d = "\x1b[90m";
        let r = "\x1b[0m";
        println!("  {d}conversation{r}  {}", self.session.session_id());
        match self.session.address() {
            Some(address) => println!("  {d}address{r}       {address}"),
            None => println!("  {d}address{r}       none"),
        }
        if let Some(job_id) = self.session.active_job() {
            println!("  {d}running scan{r}  {job_id}");
        }
        if let Some(job) = self.session.bound_job() {
            println!(
                "  {d}answering from{r} {} {} ({})",
                job.count,
                job.scan_type.label(),
                job.job_id
            );
        }
    }
}

/// Read lines on a dedicated thread; rustyline blocks.
fn spawn_input_thread(suppress_banner: bool) -> mpsc::Receiver<ReplInput> {
    let (tx, rx) = mpsc::channel(32);

    std::thread::spawn(move || {
        let config = match Config::builder().history_ignore_dups(true) {
            Ok(builder) => builder
                .auto_add_history(true)
                .completion_type(CompletionType::List)
                .build(),
            Err(e) => {
                eprintln!("Failed to configure line editor: {e}");
                let _ = tx.blocking_send(ReplInput::Quit);
                return;
            }
        };

        let mut rl = match Editor::with_config(config) {
            Ok(editor) => editor,
            Err(e) => {
                eprintln!("Failed to initialize line editor: {e}");
                let _ = tx.blocking_send(ReplInput::Quit);
                return;
            }
        };

        rl.set_helper(Some(ReplHelper));

        let hist_path = history_path();
        if let Some(parent) = hist_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = rl.load_history(&hist_path);

        if !suppress_banner {
            println!("\x1b[1mTonpixo\x1b[0m  paste a TON address, /help for commands, /quit to exit");
            println!();
        }

        loop {
            match rl.readline("\x1b[1;36m\u{203A}\x1b[0m ") {
                Ok(line) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match line.to_lowercase().as_str() {
                        "/quit" | "/exit" => {
                            let _ = tx.blocking_send(ReplInput::Quit);
                            break;
                        }
                        "/help" => {
                            print_help();
                            continue;
                        }
                        _ => {}
                    }

                    if tx.blocking_send(ReplInput::Line(line.to_string())).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    if tx.blocking_send(ReplInput::Interrupt).is_err() {
                        break;
                    }
                }
                Err(ReadlineError::Eof) => {
                    let _ = tx.blocking_send(ReplInput::Quit);
                    break;
                }
                Err(e) => {
                    eprintln!("Input error: {e}");
                    let _ = tx.blocking_send(ReplInput::Quit);
                    break;
                }
            }
        }

        let _ = rl.save_history(&hist_path);
    });

    rx
}
