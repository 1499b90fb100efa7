// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Interactive pool simulator.
//!
//! Each line is a socket or request event fed to a [`Pool`]; the actions the
//! pool asks for are printed back. Destroyed sockets are closed right away,
//! connection attempts stay pending until `connect` or `fail`.

use owo_colors::OwoColorize;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Editor, Helper};
use spacey_agent::{
    Action, AgentError, AgentOptions, ConnectOptions, FreeInfo, Pool, RequestId, SocketEvent,
    SocketId,
};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;

/// REPL configuration constants
const HISTORY_FILE: &str = ".spacey_agent_history";
const MAX_HISTORY_SIZE: usize = 1000;

/// REPL commands that can be executed with a dot prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Exit,
    Clear,
    Version,
    Options,
    Reset,
}

impl ReplCommand {
    /// Parse a REPL command from input string
    pub fn parse(input: &str) -> Option<(Self, Option<&str>)> {
        let input = input.trim();
        let rest = input.strip_prefix('.')?;

        let mut parts = rest.splitn(2, char::is_whitespace);
        let cmd = parts.next()?.to_lowercase();
        let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match cmd.as_str() {
            "help" | "h" | "?" => Some((ReplCommand::Help, arg)),
            "exit" | "quit" | "q" => Some((ReplCommand::Exit, arg)),
            "clear" | "cls" => Some((ReplCommand::Clear, arg)),
            "version" | "v" => Some((ReplCommand::Version, arg)),
            "options" | "o" => Some((ReplCommand::Options, arg)),
            "reset" => Some((ReplCommand::Reset, arg)),
            _ => None,
        }
    }

    /// Get all available commands for help/completion
    pub fn all_commands() -> &'static [(&'static str, &'static str)] {
        &[
            (".help", "Show this help message"),
            (".exit", "Exit the REPL"),
            (".clear", "Clear the screen"),
            (".version", "Show version information"),
            (".options [key=value]", "Show or change agent options"),
            (".reset", "Start over with a fresh pool"),
        ]
    }
}

/// Events accepted by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolCommand {
    /// `request host[:port]`
    Request(ConnectOptions),
    /// `connect <request>`: the connection attempt succeeded
    Connect(RequestId),
    /// `fail <request>`: the connection attempt failed
    Fail(RequestId),
    /// `free <socket> [keep-alive header]`
    Free(SocketId, Option<String>),
    /// `finish <socket>`: response done without keep-alive
    Finish(SocketId),
    /// `close <socket>`
    Close(SocketId),
    /// `timeout <socket>`
    Timeout(SocketId),
    /// `error <socket>`
    Error(SocketId),
    /// `remove <socket>`: the socket was taken over, e.g. by an upgrade
    Remove(SocketId),
    /// `cancel <request>`
    Cancel(RequestId),
    /// `stats`
    Stats,
    /// `destroy`
    Destroy,
}

const POOL_COMMANDS: &[(&str, &str)] = &[
    ("request <host[:port]>", "Ask the agent for a socket"),
    ("connect <request>", "Complete a pending connection"),
    ("fail <request>", "Fail a pending connection"),
    ("free <socket> [hint]", "Response done, socket reusable"),
    ("finish <socket>", "Response done, Connection: close"),
    ("close <socket>", "Socket closed"),
    ("timeout <socket>", "Socket timed out"),
    ("error <socket>", "Socket errored"),
    ("remove <socket>", "Detach socket from the agent"),
    ("cancel <request>", "Withdraw a waiting request"),
    ("stats", "Show pool bookkeeping"),
    ("destroy", "Destroy the agent"),
];

impl PoolCommand {
    /// Parse a simulator line
    pub fn parse(input: &str) -> Result<Self, String> {
        let mut words = input.split_whitespace();
        let cmd = words.next().ok_or("empty input")?.to_lowercase();
        let arg = words.next();
        let rest: Vec<&str> = words.collect();

        let socket = || parse_id(arg, "socket").map(SocketId);
        let request = || parse_id(arg, "request").map(RequestId);

        match cmd.as_str() {
            "request" | "req" | "r" => Ok(PoolCommand::Request(parse_target(
                arg.ok_or("request needs a target")?,
            )?)),
            "connect" => Ok(PoolCommand::Connect(request()?)),
            "fail" => Ok(PoolCommand::Fail(request()?)),
            "free" | "f" => {
                let hint = (!rest.is_empty()).then(|| rest.join(" "));
                Ok(PoolCommand::Free(socket()?, hint))
            }
            "finish" => Ok(PoolCommand::Finish(socket()?)),
            "close" => Ok(PoolCommand::Close(socket()?)),
            "timeout" => Ok(PoolCommand::Timeout(socket()?)),
            "error" => Ok(PoolCommand::Error(socket()?)),
            "remove" => Ok(PoolCommand::Remove(socket()?)),
            "cancel" => Ok(PoolCommand::Cancel(request()?)),
            "stats" | "s" => Ok(PoolCommand::Stats),
            "destroy" => Ok(PoolCommand::Destroy),
            other => Err(format!("unknown command '{}'", other)),
        }
    }
}

fn parse_id(arg: Option<&str>, what: &str) -> Result<u64, String> {
    let arg = arg.ok_or_else(|| format!("missing {} id", what))?;
    arg.trim_start_matches(['r', 's', '#'])
        .parse()
        .map_err(|_| format!("invalid {} id '{}'", what, arg))
}

fn parse_target(target: &str) -> Result<ConnectOptions, String> {
    match target.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| format!("invalid port '{}'", port))?;
            Ok(ConnectOptions::new(host, port))
        }
        None => Ok(ConnectOptions::legacy(target, None, None)),
    }
}

/// A [`Pool`] plus the bookkeeping needed to replay its actions
pub struct Simulator {
    pool: Pool,
    next_request: u64,
}

impl Simulator {
    /// Create a simulator for an agent with `options`
    pub fn new(options: AgentOptions) -> Result<Self, AgentError> {
        Ok(Self {
            pool: Pool::new(options)?,
            next_request: 1,
        })
    }

    /// Options of the simulated agent
    pub fn options(&self) -> &AgentOptions {
        self.pool.options()
    }

    /// Apply a command and describe what the pool did
    pub fn exec(&mut self, command: PoolCommand) -> Vec<String> {
        let actions = match command {
            PoolCommand::Request(options) => {
                let request = RequestId(self.next_request);
                self.next_request += 1;
                let key = self.pool.get_name(&options);
                let mut lines = vec![format!("{} for {}", request_label(request), key)];
                let actions = self.pool.add_request(request, options);
                if actions.is_empty() {
                    lines.push(format!("{} queued", request_label(request)));
                }
                lines.extend(self.replay(actions));
                return lines;
            }
            PoolCommand::Connect(request) => {
                let socket = self.pool.allocate_socket_id();
                self.pool.connect_completed(request, Ok(socket))
            }
            PoolCommand::Fail(request) => self.pool.connect_completed(
                request,
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
            ),
            PoolCommand::Free(socket, hint) => {
                let info = match hint {
                    Some(hint) => FreeInfo::reusable().with_hint(hint),
                    None => FreeInfo::reusable(),
                };
                self.pool.socket_freed(socket, info)
            }
            PoolCommand::Finish(socket) => self.pool.socket_freed(socket, FreeInfo::close()),
            PoolCommand::Close(socket) => self.pool.socket_closed(socket),
            PoolCommand::Timeout(socket) => self.pool.socket_timeout(socket),
            PoolCommand::Error(socket) => self.pool.on_socket_event(socket, SocketEvent::Error),
            PoolCommand::Remove(socket) => self.pool.remove_socket(socket),
            PoolCommand::Cancel(request) => {
                let line = if self.pool.cancel_request(request) {
                    format!("{} cancelled", request_label(request))
                } else {
                    format!("{} is not waiting", request_label(request))
                };
                return vec![line];
            }
            PoolCommand::Stats => return self.stats_lines(),
            PoolCommand::Destroy => self.pool.destroy(),
        };
        let lines = self.replay(actions);
        if lines.is_empty() {
            vec!["no action".to_string()]
        } else {
            lines
        }
    }

    /// Describe `actions`, closing destroyed sockets as they go
    fn replay(&mut self, actions: Vec<Action>) -> Vec<String> {
        let mut lines = Vec::new();
        let mut queue: VecDeque<Action> = actions.into();
        while let Some(action) = queue.pop_front() {
            let line = match action {
                Action::Connect { request, key, .. } => {
                    format!("{} connecting to {}", request_label(request), key)
                }
                Action::Assign { request, socket } => {
                    format!("{} -> {}", request_label(request), socket_label(socket))
                }
                Action::Reuse { request, socket } => format!(
                    "{} -> {} (reused)",
                    request_label(request),
                    socket_label(socket)
                ),
                Action::Fail { request, error } => {
                    format!("{} failed: {}", request_label(request), error)
                }
                Action::KeepAlive {
                    socket, timeout, ..
                } => match timeout {
                    Some(timeout) => {
                        format!("{} idle, timeout {:?}", socket_label(socket), timeout)
                    }
                    None => format!("{} idle", socket_label(socket)),
                },
                Action::Destroy { socket } => {
                    queue.extend(self.pool.socket_closed(socket));
                    format!("{} destroyed", socket_label(socket))
                }
                Action::Detach { socket } => format!("{} detached", socket_label(socket)),
            };
            lines.push(line);
        }
        lines
    }

    fn stats_lines(&self) -> Vec<String> {
        let stats = self.pool.stats();
        let mut lines = vec![format!(
            "sockets {}, connecting {}",
            stats.total_socket_count, stats.pending_connects
        )];
        for (key, endpoint) in &stats.endpoints {
            lines.push(format!(
                "  {}: in use {}, free {}, queued {}, connecting {}",
                key, endpoint.in_use, endpoint.free, endpoint.queued, endpoint.connecting
            ));
        }
        lines
    }
}

fn request_label(request: RequestId) -> String {
    format!("r{}", request.0)
}

fn socket_label(socket: SocketId) -> String {
    format!("s{}", socket.0)
}

/// Helper struct for rustyline that provides completion, hints, and highlighting
#[derive(Default)]
struct AgentHelper {
    /// Command words for completion
    keywords: Vec<String>,
}

impl AgentHelper {
    fn new() -> Self {
        let keywords = POOL_COMMANDS
            .iter()
            .chain(ReplCommand::all_commands())
            .filter_map(|(usage, _)| usage.split_whitespace().next())
            .map(String::from)
            .collect();

        Self { keywords }
    }
}

impl Completer for AgentHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        // Only the command word completes
        let word = &line[..pos];
        if word.is_empty() || word.contains(char::is_whitespace) {
            return Ok((pos, vec![]));
        }

        let matches: Vec<Pair> = self
            .keywords
            .iter()
            .filter(|kw| kw.starts_with(word))
            .map(|kw| Pair {
                display: kw.clone(),
                replacement: kw[word.len()..].to_string(),
            })
            .collect();

        Ok((pos, matches))
    }
}

impl Hinter for AgentHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<Self::Hint> {
        if pos < line.len() || line.len() < 2 || line.contains(char::is_whitespace) {
            return None;
        }

        self.keywords
            .iter()
            .find(|kw| kw.starts_with(line) && kw.len() > line.len())
            .map(|kw| kw[line.len()..].to_string().dimmed().to_string())
    }
}

impl Highlighter for AgentHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        if !self.keywords.iter().any(|kw| kw == cmd) {
            return Cow::Borrowed(line);
        }
        let cmd = if cmd.starts_with('.') {
            cmd.magenta().to_string()
        } else {
            cmd.cyan().bold().to_string()
        };
        let sep = if line.contains(' ') { " " } else { "" };
        Cow::Owned(format!("{}{}{}", cmd, sep, rest.yellow()))
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

impl Validator for AgentHelper {}

impl Helper for AgentHelper {}

/// The interactive pool simulator
pub struct Repl {
    simulator: Simulator,
    editor: Editor<AgentHelper, DefaultHistory>,
    history_path: PathBuf,
}

impl Repl {
    /// Create a new REPL instance
    pub fn new(options: AgentOptions) -> anyhow::Result<Self> {
        let config = Config::builder()
            .history_ignore_dups(true)?
            .history_ignore_space(true)
            .max_history_size(MAX_HISTORY_SIZE)?
            .auto_add_history(true)
            .build();

        let mut editor = Editor::with_config(config)?;
        editor.set_helper(Some(AgentHelper::new()));

        // Determine history file path
        let history_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spacey")
            .join(HISTORY_FILE);

        // Create parent directory if it doesn't exist
        if let Some(parent) = history_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        // Load history
        let _ = editor.load_history(&history_path);

        Ok(Self {
            simulator: Simulator::new(options)?,
            editor,
            history_path,
        })
    }

    /// Run the REPL main loop
    pub fn run(&mut self) -> rustyline::Result<()> {
        self.print_banner();

        loop {
            let prompt = format!("{} ", "agent>".bright_green().bold());

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let trimmed = line.trim();

                    if trimmed.is_empty() {
                        continue;
                    }

                    if let Some((cmd, arg)) = ReplCommand::parse(trimmed) {
                        match self.execute_command(cmd, arg) {
                            CommandResult::Continue => continue,
                            CommandResult::Exit => break,
                        }
                    }

                    match PoolCommand::parse(trimmed) {
                        Ok(command) => {
                            for line in self.simulator.exec(command) {
                                println!("  {}", line);
                            }
                        }
                        Err(message) => eprintln!("{}: {}", "Error".red().bold(), message),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".dimmed());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "^D".dimmed());
                    break;
                }
                Err(err) => {
                    eprintln!("{}: {:?}", "Error".red().bold(), err);
                    break;
                }
            }
        }

        // Save history
        let _ = self.editor.save_history(&self.history_path);
        Ok(())
    }

    fn print_banner(&self) {
        let version = env!("CARGO_PKG_VERSION");
        println!();
        println!(
            "  {} {} {}",
            "Spacey Agent Simulator".white().bold(),
            "v".dimmed(),
            version.bright_yellow()
        );
        println!(
            "  {} {} {}",
            "Type".dimmed(),
            ".help".cyan(),
            "for available commands".dimmed()
        );
        println!();
    }

    fn execute_command(&mut self, cmd: ReplCommand, arg: Option<&str>) -> CommandResult {
        match cmd {
            ReplCommand::Help => self.print_help(),
            ReplCommand::Exit => return CommandResult::Exit,
            ReplCommand::Clear => print!("\x1B[2J\x1B[H"),
            ReplCommand::Version => {
                println!(
                    "{}: {}",
                    "spacey-agent".bright_cyan().bold(),
                    env!("CARGO_PKG_VERSION").yellow()
                );
            }
            ReplCommand::Options => match arg {
                Some(assignment) => self.set_option(assignment),
                None => self.print_options(),
            },
            ReplCommand::Reset => {
                let options = self.simulator.options().clone();
                self.reset(options);
            }
        }
        CommandResult::Continue
    }

    /// Changing an option starts a new pool
    fn set_option(&mut self, assignment: &str) {
        let Some((key, value)) = assignment.split_once('=') else {
            eprintln!("{}: expected key=value", "Error".red().bold());
            return;
        };
        let mut options = self.simulator.options().clone();
        match options.set(key.trim(), value) {
            Ok(()) => self.reset(options),
            Err(err) => eprintln!("{}: {}", "Error".red().bold(), err),
        }
    }

    fn reset(&mut self, options: AgentOptions) {
        match Simulator::new(options) {
            Ok(simulator) => {
                tracing::debug!(options = ?simulator.options(), "simulator reset");
                self.simulator = simulator;
                println!("  {}", "fresh pool".dimmed());
            }
            Err(err) => eprintln!("{}: {}", "Error".red().bold(), err),
        }
    }

    fn print_options(&self) {
        let options = self.simulator.options();
        let limit = |limit: Option<usize>| match limit {
            Some(limit) => limit.to_string(),
            None => "Infinity".to_string(),
        };
        println!("  {:20} {}", "keep-alive".cyan(), options.keep_alive);
        println!("  {:20} {}", "keep-alive-msecs".cyan(), options.keep_alive_msecs);
        println!("  {:20} {}", "max-sockets".cyan(), limit(options.max_sockets));
        println!("  {:20} {}", "max-free-sockets".cyan(), options.max_free_sockets);
        println!("  {:20} {}", "max-total-sockets".cyan(), limit(options.max_total_sockets));
        println!("  {:20} {}", "scheduling".cyan(), options.scheduling);
        println!(
            "  {:20} {}",
            "timeout".cyan(),
            options
                .timeout
                .map_or_else(|| "none".to_string(), |ms| format!("{}ms", ms))
        );
    }

    fn print_help(&self) {
        println!();
        println!("{}", "Pool Events:".white().bold());
        println!();
        for (cmd, desc) in POOL_COMMANDS {
            println!("  {:24} {}", cmd.cyan(), desc.dimmed());
        }

        println!();
        println!("{}", "REPL Commands:".white().bold());
        println!();
        for (cmd, desc) in ReplCommand::all_commands() {
            println!("  {:24} {}", cmd.cyan(), desc.dimmed());
        }
        println!();
    }
}

/// Result of executing a REPL command
enum CommandResult {
    Continue,
    Exit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keep_alive(max_sockets: Option<usize>) -> Simulator {
        Simulator::new(AgentOptions {
            max_sockets,
            ..AgentOptions::keep_alive()
        })
        .unwrap()
    }

    fn run(sim: &mut Simulator, line: &str) -> Vec<String> {
        sim.exec(PoolCommand::parse(line).unwrap())
    }

    #[test]
    fn test_repl_command_parse() {
        assert!(matches!(
            ReplCommand::parse(".help"),
            Some((ReplCommand::Help, None))
        ));
        assert!(matches!(
            ReplCommand::parse(".exit"),
            Some((ReplCommand::Exit, None))
        ));
        assert!(matches!(
            ReplCommand::parse(".options max-sockets=2"),
            Some((ReplCommand::Options, Some("max-sockets=2")))
        ));
        assert!(ReplCommand::parse("request localhost:80").is_none());
    }

    #[test]
    fn test_pool_command_parse() {
        assert_eq!(
            PoolCommand::parse("request example.com:8080"),
            Ok(PoolCommand::Request(ConnectOptions::new("example.com", 8080)))
        );
        assert_eq!(
            PoolCommand::parse("free s3 timeout=5, max=100"),
            Ok(PoolCommand::Free(
                SocketId(3),
                Some("timeout=5, max=100".to_string())
            ))
        );
        assert_eq!(
            PoolCommand::parse("connect r1"),
            Ok(PoolCommand::Connect(RequestId(1)))
        );
        assert!(PoolCommand::parse("close").is_err());
        assert!(PoolCommand::parse("request host:port").is_err());
        assert!(PoolCommand::parse("bogus 1").is_err());
    }

    #[test]
    fn test_simulated_reuse() {
        let mut sim = keep_alive(Some(1));

        assert_eq!(
            run(&mut sim, "request localhost:80"),
            vec!["r1 for localhost:80:", "r1 connecting to localhost:80:"]
        );
        assert_eq!(run(&mut sim, "connect r1"), vec!["r1 -> s1"]);
        assert_eq!(
            run(&mut sim, "request localhost:80"),
            vec!["r2 for localhost:80:", "r2 queued"]
        );
        assert_eq!(run(&mut sim, "free s1"), vec!["r2 -> s1"]);
        assert_eq!(run(&mut sim, "free s1"), vec!["s1 idle"]);
        assert_eq!(
            run(&mut sim, "request localhost:80"),
            vec!["r3 for localhost:80:", "r3 -> s1 (reused)"]
        );
    }

    #[test]
    fn test_simulated_destroy_closes() {
        let mut sim = keep_alive(None);
        run(&mut sim, "request localhost:80");
        run(&mut sim, "connect r1");

        assert_eq!(run(&mut sim, "finish s1"), vec!["s1 destroyed"]);
        assert_eq!(run(&mut sim, "stats"), vec!["sockets 0, connecting 0"]);
    }

    #[test]
    fn test_labels_use_bare_ids() {
        assert_eq!(request_label(RequestId(7)), "r7");
        assert_eq!(socket_label(SocketId(12)), "s12");
    }

    #[test]
    fn test_simulated_cancel() {
        let mut sim = keep_alive(Some(1));
        run(&mut sim, "request localhost:80");
        run(&mut sim, "request localhost:80");

        assert_eq!(run(&mut sim, "cancel r2"), vec!["r2 cancelled"]);
        assert_eq!(run(&mut sim, "cancel r2"), vec!["r2 is not waiting"]);
    }
}
