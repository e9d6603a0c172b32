//! REPL – Read-Eval-Print Loop for the diagstream shell.
//!
//! Supported slash-commands:
//!   /connect          – mount the viewer on the backend's diagnostics feed
//!   /disconnect       – unmount the viewer (disposes the feed, clears the log)
//!   /events [n]       – print the newest `n` events (default: all)
//!   /emit [message]   – ask the backend to publish a test event
//!   /clear            – empty the log, keep the feed
//!   /health           – probe the backend's `/health`
//!   /serve [port]     – run a local diagnostics server in the background
//!   /status           – feed, log and server state
//!   /settings         – interactively edit `~/.diagstream/config.toml`
//!   /help             – show this list
//!   /quit | /exit     – gracefully exit the CLI

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diagstream_cockpit::DiagnosticsServer;
use diagstream_middleware::{EmitOutcome, EmitTrigger, Endpoints, EventBus, FeedClient};
use diagstream_types::Event;
use diagstream_viewer::{render_events, Viewer, EMPTY_PLACEHOLDER};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{self, Config};
use crate::health;

/// One parsed line of input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect,
    Disconnect,
    Events(Option<usize>),
    Emit(Option<String>),
    Clear,
    Health,
    Serve(Option<u16>),
    Status,
    Settings,
    Help,
    Quit,
    /// Known command, bad argument; carries the usage line.
    Usage(&'static str),
    Unknown(String),
}

/// Parse a trimmed, non-empty input line.
pub fn parse_command(line: &str) -> Command {
    let (name, arg) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, Some(rest.trim()).filter(|r| !r.is_empty())),
        None => (line, None),
    };
    match name {
        "/connect" => Command::Connect,
        "/disconnect" => Command::Disconnect,
        "/events" => match arg.map(str::parse::<usize>) {
            None => Command::Events(None),
            Some(Ok(n)) => Command::Events(Some(n)),
            Some(Err(_)) => Command::Usage("/events [n]"),
        },
        "/emit" => Command::Emit(arg.map(str::to_string)),
        "/clear" => Command::Clear,
        "/health" => Command::Health,
        "/serve" => match arg.map(str::parse::<u16>) {
            None => Command::Serve(None),
            Some(Ok(p)) => Command::Serve(Some(p)),
            Some(Err(_)) => Command::Usage("/serve [port]"),
        },
        "/status" => Command::Status,
        "/settings" => Command::Settings,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    }
}

/// One-line summary printed as events arrive.
pub fn format_event_line(event: &Event) -> String {
    let node = event.node.as_deref().unwrap_or("-");
    let ts = event.timestamp.as_deref().unwrap_or("");
    let payload = serde_json::Value::Object(event.payload.clone());
    format!("{ts} {} [{node}] {payload}", event.kind).trim_start().to_string()
}

/// Slot holding the mounted viewer, shared with the Ctrl-C handler.
pub type ViewerSlot = Arc<Mutex<Option<Viewer>>>;

fn lock(slot: &ViewerSlot) -> MutexGuard<'_, Option<Viewer>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

struct LocalServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// State carried between commands.
pub struct Session {
    rt: Runtime,
    cfg: Config,
    endpoints: Endpoints,
    trigger: Arc<EmitTrigger>,
    viewer: ViewerSlot,
    bus: EventBus,
    server: Option<LocalServer>,
}

impl Session {
    pub fn new(rt: Runtime, cfg: Config) -> Self {
        let endpoints = Endpoints::new(&cfg.api_base_url);
        Self {
            rt,
            trigger: Arc::new(EmitTrigger::new(endpoints.clone())),
            endpoints,
            cfg,
            viewer: Arc::new(Mutex::new(None)),
            bus: EventBus::default(),
            server: None,
        }
    }

    pub fn viewer_slot(&self) -> ViewerSlot {
        Arc::clone(&self.viewer)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn feed_client(&self) -> FeedClient {
        FeedClient::builder()
            .initial_delay(self.cfg.reconnect_initial())
            .max_delay(self.cfg.reconnect_max())
            .build()
    }

    /// Run one command. Returns `false` when the REPL should stop.
    pub fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Connect => self.cmd_connect(),
            Command::Disconnect => self.cmd_disconnect(),
            Command::Events(n) => self.cmd_events(n),
            Command::Emit(message) => self.cmd_emit(message),
            Command::Clear => self.cmd_clear(),
            Command::Health => self.cmd_health(),
            Command::Serve(port) => self.cmd_serve(port),
            Command::Status => self.cmd_status(),
            Command::Settings => self.cmd_settings(),
            Command::Help => cmd_help(),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                return false;
            }
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage.bold()),
            Command::Unknown(other) => println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "/help".bold()
            ),
        }
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Command handlers
    // ─────────────────────────────────────────────────────────────────────────

    fn cmd_connect(&mut self) {
        let mut slot = lock(&self.viewer);
        if let Some(viewer) = slot.as_ref() {
            println!(
                "  Already connected to {}",
                viewer.url().unwrap_or_default().bold()
            );
            return;
        }

        let url = self.endpoints.stream_url();
        let _enter = self.rt.enter();
        let viewer = Viewer::mount_with_listener(
            &self.feed_client(),
            url.clone(),
            self.cfg.log_capacity,
            |snapshot| {
                if let Some(event) = snapshot.latest() {
                    println!("  {} {}", "▸".cyan(), format_event_line(event));
                }
            },
        );
        *slot = Some(viewer);
        info!(url = %url, capacity = self.cfg.log_capacity, "viewer mounted");
        println!("  {} Listening on {}", "✓".green().bold(), url.bold());
    }

    fn cmd_disconnect(&mut self) {
        match lock(&self.viewer).take() {
            Some(mut viewer) => {
                viewer.unmount();
                info!("viewer unmounted");
                println!("  {} Disconnected.", "✓".green().bold());
            }
            None => println!("  {}", "Not connected.".dimmed()),
        }
    }

    fn cmd_events(&self, limit: Option<usize>) {
        let slot = lock(&self.viewer);
        let Some(viewer) = slot.as_ref() else {
            println!("  {}", EMPTY_PLACEHOLDER.dimmed());
            return;
        };
        let snapshot = viewer.snapshot();
        let shown = limit.unwrap_or(snapshot.len()).min(snapshot.len());
        println!("{}", render_events(&snapshot[..shown]));
        if shown < snapshot.len() {
            println!("  {}", format!("({} older event(s) not shown)", snapshot.len() - shown).dimmed());
        }
    }

    fn cmd_emit(&self, message: Option<String>) {
        let message = message.unwrap_or_else(|| self.cfg.emit_message.clone());
        let trigger = Arc::clone(&self.trigger);
        self.rt.spawn(async move {
            match trigger.trigger(&message).await {
                Ok(EmitOutcome::Sent) => println!("  {} Emitted {}", "✓".green().bold(), message.bold()),
                Ok(EmitOutcome::Busy) => println!("  {}", "An emit is already in flight.".yellow()),
                Err(e) => println!("  {}: {}", "Emit failed".red(), e),
            }
        });
    }

    fn cmd_clear(&self) {
        match lock(&self.viewer).as_ref() {
            Some(viewer) => {
                viewer.clear();
                println!("  {} Log cleared.", "✓".green().bold());
            }
            None => println!("  {}", "Not connected.".dimmed()),
        }
    }

    fn cmd_health(&self) {
        print!("  Probing {} … ", self.endpoints.health_url().dimmed());
        io::stdout().flush().ok();
        match self.rt.block_on(health::fetch(&self.endpoints)) {
            Ok(h) => println!(
                "{} (env {}, up {:.1}s, at {})",
                h.status.green(),
                h.env.bold(),
                h.uptime,
                h.timestamp.dimmed()
            ),
            Err(e) => println!("{}\n  {}", "offline".red(), e.to_string().dimmed()),
        }
    }

    fn cmd_serve(&mut self, port: Option<u16>) {
        if let Some(server) = &self.server {
            println!("  Already serving on {}", server.addr.to_string().bold());
            return;
        }
        let server = DiagnosticsServer::new(self.bus.clone())
            .with_port(port.unwrap_or(self.cfg.server_port))
            .with_env(self.cfg.env.clone());
        let bound = match self.rt.block_on(server.bind()) {
            Ok(bound) => bound,
            Err(e) => {
                println!("  {}: {}", "Could not start server".red(), e);
                return;
            }
        };
        let addr = bound.local_addr();
        let task = self.rt.spawn(async move {
            if let Err(e) = bound.serve().await {
                warn!(error = %e, "diagnostics server stopped");
            }
        });
        self.server = Some(LocalServer { addr, task });
        println!(
            "  {} Diagnostics server on {} (env {})",
            "✓".green().bold(),
            addr.to_string().bold(),
            self.cfg.env.yellow()
        );
    }

    fn cmd_status(&self) {
        println!("{}", "Status".bold().underline());
        println!("  Backend      : {}", self.endpoints.base().bold());
        match lock(&self.viewer).as_ref() {
            Some(viewer) => {
                println!("  Feed         : {:?}", viewer.state());
                println!("  Events       : {}/{}", viewer.len(), viewer.capacity());
                println!("  Disconnects  : {}", viewer.transport_errors());
            }
            None => println!("  Feed         : {}", "not connected".dimmed()),
        }
        println!(
            "  Emit         : {}",
            if self.trigger.is_busy() { "in flight".yellow() } else { "idle".green() }
        );
        match &self.server {
            Some(server) => println!(
                "  Local server : {} ({} stream(s))",
                server.addr.to_string().bold(),
                self.bus.subscriber_count()
            ),
            None => println!("  Local server : {}", "stopped".dimmed()),
        }
    }

    fn cmd_settings(&mut self) {
        let mut cfg = self.cfg.clone();

        println!("{}", "Settings Editor".bold().underline());
        cfg.api_base_url = prompt_str(&format!("  Backend URL    [{}]: ", cfg.api_base_url), &cfg.api_base_url);
        cfg.server_port = prompt_parsed(&format!("  Server port    [{}]: ", cfg.server_port), cfg.server_port);
        cfg.env = prompt_str(&format!("  Environment    [{}]: ", cfg.env), &cfg.env);
        cfg.log_capacity = prompt_parsed(&format!("  Log capacity   [{}]: ", cfg.log_capacity), cfg.log_capacity).max(1);
        cfg.emit_message = prompt_str(&format!("  Emit message   [{}]: ", cfg.emit_message), &cfg.emit_message);

        match config::save(&cfg) {
            Ok(()) => println!(
                "{} {}",
                "✓ Settings saved to".green(),
                config::config_path().display().to_string().bold()
            ),
            Err(e) => println!("{}: {}", "Error saving config".red(), e),
        }

        self.endpoints = Endpoints::new(&cfg.api_base_url);
        self.trigger = Arc::new(EmitTrigger::new(self.endpoints.clone()));
        self.cfg = cfg;
        if lock(&self.viewer).is_some() {
            println!(
                "  {}",
                "Feed settings apply on the next /disconnect + /connect.".dimmed()
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut viewer) = lock(&self.viewer).take() {
            viewer.unmount();
        }
        if let Some(server) = self.server.take() {
            server.task.abort();
        }
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(mut session: Session, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "diagstream>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !session.execute(parse_command(line)) {
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "diagstream Commands".bold().underline());
    println!("  {}        – mount the viewer on the diagnostics feed", "/connect".bold().cyan());
    println!("  {}     – unmount the viewer and clear the log", "/disconnect".bold().cyan());
    println!("  {}     – show the newest n events (default all)", "/events [n]".bold().cyan());
    println!("  {} – publish a test event via the backend", "/emit [message]".bold().cyan());
    println!("  {}          – empty the log, keep the feed", "/clear".bold().cyan());
    println!("  {}         – probe the backend", "/health".bold().cyan());
    println!("  {}   – run a local diagnostics server", "/serve [port]".bold().cyan());
    println!("  {}         – feed, log and server state", "/status".bold().cyan());
    println!("  {}       – edit ~/.diagstream/config.toml", "/settings".bold().cyan());
    println!("  {}    – exit the CLI", "/quit  /exit".bold().cyan());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Prompt for a parsable value.  Returns `default` on Enter or bad input.
fn prompt_parsed<T>(msg: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    let raw = prompt_str(msg, &default.to_string());
    match raw.parse::<T>() {
        Ok(v) => v,
        Err(_) => {
            println!(
                "  {} '{}' is not valid here, keeping {}",
                "Warning:".yellow(),
                raw,
                default
            );
            default
        }
    }
}

/// Prompt for a string value.  Returns `default` when the user presses Enter.
pub(crate) fn prompt_str(msg: &str, default: &str) -> String {
    print!("{}", msg);
    io::stdout().flush().ok();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let trimmed = line.trim().to_string();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse_command("/connect"), Command::Connect);
        assert_eq!(parse_command("/disconnect"), Command::Disconnect);
        assert_eq!(parse_command("/clear"), Command::Clear);
        assert_eq!(parse_command("/exit"), Command::Quit);
        assert_eq!(parse_command("/quit"), Command::Quit);
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(parse_command("/events 5"), Command::Events(Some(5)));
        assert_eq!(parse_command("/events"), Command::Events(None));
        assert_eq!(parse_command("/serve 9001"), Command::Serve(Some(9001)));
        assert_eq!(
            parse_command("/emit hello   world"),
            Command::Emit(Some("hello   world".into()))
        );
        assert_eq!(parse_command("/emit"), Command::Emit(None));
        assert_eq!(parse_command("/emit   "), Command::Emit(None));
    }

    #[test]
    fn bad_arguments_yield_usage() {
        assert_eq!(parse_command("/events many"), Command::Usage("/events [n]"));
        assert_eq!(parse_command("/serve 70000"), Command::Usage("/serve [port]"));
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(parse_command("/launch"), Command::Unknown("/launch".into()));
    }

    #[test]
    fn event_line_summarises_kind_node_and_payload() {
        let ev = Event::new("tool_called")
            .with_node("planner")
            .with_payload_entry("tool", "search")
            .with_timestamp("2024-01-01T00:00:00+00:00");
        assert_eq!(
            format_event_line(&ev),
            r#"2024-01-01T00:00:00+00:00 tool_called [planner] {"tool":"search"}"#
        );
        assert_eq!(format_event_line(&Event::new("x")), "x [-] {}");
    }

    #[test]
    fn session_serves_and_reports_status() {
        let rt = Runtime::new().unwrap();
        let mut session = Session::new(rt, Config::default());
        assert!(session.execute(Command::Serve(Some(0))));
        let addr = session.server.as_ref().map(|s| s.addr).unwrap();
        assert_ne!(addr.port(), 0);

        // A second /serve keeps the first server.
        assert!(session.execute(Command::Serve(Some(0))));
        assert_eq!(session.server.as_ref().map(|s| s.addr), Some(addr));
        assert!(!session.execute(Command::Quit));
    }

    #[test]
    fn connect_and_disconnect_manage_the_viewer() {
        let rt = Runtime::new().unwrap();
        let mut session = Session::new(rt, Config::default());
        session.execute(Command::Connect);
        assert!(lock(&session.viewer).is_some());
        session.execute(Command::Connect);
        session.execute(Command::Disconnect);
        assert!(lock(&session.viewer).is_none());
        session.execute(Command::Disconnect);
    }
}
