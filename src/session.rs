//! `cc-bridge start`: one supervised shell mirrored to a paired viewer.
//!
//! A single task owns the PTY, the aggregator and every timer; hook events,
//! relay traffic, signals and terminal input all arrive as `select!`
//! branches on that task.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;

use crate::aggregator::OutputAggregator;
use crate::config::StartArgs;
use crate::dedup::MessageDedup;
use crate::events::{EventEmitter, LifecycleEvent};
use crate::hook_config::{default_settings_path, hooks_installed};
use crate::hooks::{self, IngestedEvent, SourceArbiter, HOOK_PORT_ENV};
use crate::pairing::{default_session_name, SessionPairing};
use crate::protocol::{Envelope, InteractionOption, MessageKind, Role, SemanticMessage};
use crate::pty::{self, PtyCommand, PtySession};
use crate::relay_client::{ConnectionState, RelayClient, RelayClientOptions};
use crate::runtime::SessionRegistry;

/// Gap between typed viewer input and the Enter that submits it.
const ENTER_DELAY: Duration = Duration::from_millis(50);
const EXIT_POLL: Duration = Duration::from_secs(1);
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Text the PTY should receive for a choice made by the viewer.
pub fn reply_for_option(option: &InteractionOption) -> String {
    option.reply_text()
}

/// Everything between raw PTY output / hook events and outbound envelopes.
///
/// Kept free of I/O so the routing rules can be driven directly.
pub struct SessionBridge {
    aggregator: OutputAggregator,
    dedup: MessageDedup,
    arbiter: SourceArbiter,
    outstanding: Option<SemanticMessage>,
}

impl SessionBridge {
    pub fn new(aggregator: OutputAggregator, arbiter: SourceArbiter) -> Self {
        Self {
            aggregator,
            dedup: MessageDedup::default(),
            arbiter,
            outstanding: None,
        }
    }

    /// Feed decoded PTY text; returns the debounce delay to arm.
    pub fn push_output(&mut self, text: &str) -> Duration {
        self.aggregator.push(text)
    }

    pub fn on_quiet(&mut self, now: Instant) -> Vec<Envelope> {
        let admitted: Vec<SemanticMessage> = self
            .aggregator
            .on_quiet()
            .into_iter()
            .filter(|message| self.arbiter.admits_scraped(message, now))
            .collect();
        let mut envelopes = Vec::with_capacity(admitted.len());
        for message in admitted {
            if self.dedup.should_emit(&message) {
                envelopes.push(self.route(message));
            }
        }
        envelopes
    }

    /// Hook events are distinct occurrences, so they are never suppressed.
    /// They are still recorded so the scraped echo of the same message is.
    pub fn on_hook_event(&mut self, event: IngestedEvent, now: Instant) -> Vec<Envelope> {
        self.arbiter.record_hook_event(now);
        let mut envelopes = Vec::with_capacity(2);
        if let Some(status) = event.status {
            envelopes.push(Envelope::status(status.status, status.message));
        }
        if let Some(message) = event.message {
            self.dedup.remember(&message);
            envelopes.push(self.route(message));
        }
        envelopes
    }

    fn route(&mut self, message: SemanticMessage) -> Envelope {
        if message.requires_response {
            self.outstanding = Some(message.clone());
        } else if matches!(message.kind, MessageKind::UserInput | MessageKind::ToolCall) {
            self.outstanding = None;
        }
        Envelope::message(message)
    }

    /// Map viewer input to PTY text. An option id of the outstanding prompt
    /// becomes that option's reply; anything else is typed as-is. Blank
    /// input yields `None`.
    pub fn reply_for_input(&mut self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return None;
        }
        let chosen = self
            .outstanding
            .as_ref()
            .and_then(|message| message.options.iter().find(|option| option.id == trimmed))
            .map(reply_for_option);
        if chosen.is_some() {
            self.outstanding = None;
        }
        Some(chosen.unwrap_or_else(|| trimmed.to_string()))
    }

    pub fn outstanding(&self) -> Option<&SemanticMessage> {
        self.outstanding.as_ref()
    }
}

/// Incremental UTF-8 decoding across PTY reads, which may split a
/// character.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match error.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Truncated sequence: wait for the next read.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.pending = rest.to_vec();
        out
    }
}

struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    /// Switch stdin to raw mode when it is a terminal.
    fn enable() -> Option<Self> {
        use nix::sys::termios;
        use std::io::IsTerminal;

        if !std::io::stdin().is_terminal() {
            return None;
        }
        let original = termios::tcgetattr(std::io::stdin()).ok()?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &raw).ok()?;
        Some(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios;
        let _ = termios::tcsetattr(std::io::stdin(), termios::SetArg::TCSANOW, &self.original);
    }
}

fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (stdin_tx, stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    stdin_rx
}

fn send_all(client: &RelayClient, envelopes: Vec<Envelope>) {
    for envelope in &envelopes {
        client.send(envelope);
    }
}

fn state_event(state: ConnectionState) -> LifecycleEvent {
    let attempt = match state {
        ConnectionState::Reconnecting { attempt } => Some(attempt),
        _ => None,
    };
    LifecycleEvent::RelayState {
        state: state.as_str(),
        attempt,
    }
}

pub async fn run_start(args: StartArgs) -> Result<()> {
    let events = EventEmitter::new(args.json_events);

    let installed = default_settings_path().is_some_and(|path| hooks_installed(&path));
    if !installed {
        eprintln!("[cc-bridge] agent hooks are not installed; output will be scraped from the terminal.");
        eprintln!("[cc-bridge] run `cc-bridge install-hooks` for structured events.");
    }

    let cwd = std::env::current_dir().context("failed to get current directory")?;
    let name = args.name.clone().unwrap_or_else(|| {
        default_session_name(&cwd, std::env::var("USER").ok().as_deref())
    });
    let pairing = SessionPairing::generate(Some(name.clone()));

    let mut sigwinch = signal(SignalKind::window_change())
        .context("failed to register SIGWINCH handler")?;
    let mut sigterm = signal(SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;

    // Hook listener first: a taken port is fatal before anything is spawned.
    let (raw_tx, raw_rx) = hooks::hook_queue();
    let (hook_addr, hook_server) = hooks::serve_hooks(args.port, raw_tx)
        .await
        .context("failed to start hook listener")?;
    let (hook_tx, mut hook_rx) = mpsc::channel::<IngestedEvent>(64);
    let hook_worker = hooks::spawn_ingest_worker(raw_rx, hook_tx);

    let pid_file = match SessionRegistry::default_location().and_then(|registry| registry.register(args.port)) {
        Ok(guard) => Some(guard),
        Err(error) => {
            tracing::warn!(target = "cc_bridge::session", error = %error, "session will not be listed by `status`");
            None
        }
    };

    let shell = args.shell.clone().unwrap_or_else(pty::default_shell);
    let (rows, cols) = pty::terminal_size().unwrap_or((24, 80));
    let command = PtyCommand::new(shell)
        .cwd(&cwd)
        .env(HOOK_PORT_ENV, args.port.to_string())
        .size(rows, cols);
    let (pty, mut pty_rx) = match PtySession::spawn(&command) {
        Ok(spawned) => spawned,
        Err(error) => {
            hook_server.abort();
            hook_worker.abort();
            return Err(error).context("failed to start shell");
        }
    };

    let options = RelayClientOptions::new(
        args.server.clone(),
        pairing.session_id.clone(),
        pairing.secret.clone(),
        Role::AgentSide,
    );
    let (client, mut inbound_rx) = RelayClient::new(options);
    let mut states = client.subscribe_state();
    let mut states_open = true;
    client.start();
    if let Err(error) = client
        .wait_connected(Duration::from_secs(args.connect_timeout))
        .await
    {
        client.close().await;
        pty.shutdown();
        hook_server.abort();
        hook_worker.abort();
        return Err(error).with_context(|| format!("cannot reach relay at {}", args.server));
    }

    tracing::info!(
        target = "cc_bridge::session",
        session_id = %pairing.session_id,
        hook_addr = %hook_addr,
        "session started"
    );
    events.emit(LifecycleEvent::SessionStarted {
        session_id: pairing.session_id.clone(),
        name: name.clone(),
        hook_port: hook_addr.port(),
    });
    println!();
    if let Some(qr) = pairing.render_qr() {
        println!("{qr}");
    }
    println!("  Session:      {name}");
    println!("  Pairing code: {}", pairing.to_uri());
    println!("  Relay:        {}", args.server);
    println!();

    let raw_mode = RawModeGuard::enable();
    let mut stdin_rx = spawn_stdin_reader();
    let mut stdout = tokio::io::stdout();

    let mut bridge = SessionBridge::new(
        OutputAggregator::default(),
        SourceArbiter::new(installed),
    );
    let mut decoder = Utf8Decoder::default();

    let debounce = tokio::time::sleep(FAR_FUTURE);
    tokio::pin!(debounce);
    let mut debounce_armed = false;
    let mut pending_enters: VecDeque<tokio::time::Instant> = VecDeque::new();

    let mut exit_poll = tokio::time::interval(EXIT_POLL);
    exit_poll.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut running = true;
    while running {
        let next_enter = pending_enters
            .front()
            .copied()
            .unwrap_or_else(|| tokio::time::Instant::now() + FAR_FUTURE);

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                running = false;
            }

            _ = sigterm.recv() => {
                running = false;
            }

            // Local keyboard → PTY
            Some(data) = stdin_rx.recv() => {
                if let Err(error) = pty.write_all(&data) {
                    tracing::warn!(target = "cc_bridge::session", error = %error, "stdin passthrough failed");
                }
            }

            chunk = pty_rx.recv() => {
                let Some(chunk) = chunk else {
                    running = false;
                    continue;
                };
                let _ = stdout.write_all(&chunk).await;
                let _ = stdout.flush().await;

                let text = decoder.decode(&chunk);
                let delay = bridge.push_output(&text);
                debounce.as_mut().reset(tokio::time::Instant::now() + delay);
                debounce_armed = true;
            }

            _ = &mut debounce, if debounce_armed => {
                debounce_armed = false;
                send_all(&client, bridge.on_quiet(Instant::now()));
            }

            Some(event) = hook_rx.recv() => {
                send_all(&client, bridge.on_hook_event(event, Instant::now()));
            }

            Some(envelope) = inbound_rx.recv() => {
                match envelope {
                    Envelope::Input { text } => {
                        if let Some(reply) = bridge.reply_for_input(&text) {
                            let typed = reply.trim_end_matches('\n');
                            if !typed.is_empty() {
                                if let Err(error) = pty.write_all(typed.as_bytes()) {
                                    tracing::warn!(target = "cc_bridge::session", error = %error, "viewer input write failed");
                                }
                            }
                            pending_enters.push_back(tokio::time::Instant::now() + ENTER_DELAY);
                        }
                    }
                    Envelope::Interrupt {} => {
                        let _ = pty.write_all(b"\x03");
                    }
                    Envelope::Resize { cols, rows } => {
                        if let Err(error) = pty.resize(rows, cols) {
                            tracing::warn!(target = "cc_bridge::session", error = %error, "viewer resize failed");
                        }
                    }
                    Envelope::Paired {} => {
                        events.emit(LifecycleEvent::Paired { session_id: pairing.session_id.clone() });
                        eprint!("\r\n[cc-bridge] viewer connected\r\n");
                    }
                    Envelope::AppDisconnected {} => {
                        events.emit(LifecycleEvent::ViewerDisconnected { session_id: pairing.session_id.clone() });
                        tracing::info!(target = "cc_bridge::session", "viewer disconnected");
                    }
                    other => {
                        tracing::debug!(target = "cc_bridge::session", kind = other.type_name(), "ignoring envelope");
                    }
                }
            }

            _ = tokio::time::sleep_until(next_enter), if !pending_enters.is_empty() => {
                pending_enters.pop_front();
                let _ = pty.write_all(b"\r");
            }

            state = states.recv(), if states_open => {
                match state {
                    Ok(state) => {
                        events.emit(state_event(state));
                        if state == ConnectionState::Failed {
                            eprint!("\r\n[cc-bridge] relay connection lost; the local shell keeps running\r\n");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        states_open = false;
                    }
                }
            }

            _ = exit_poll.tick() => {
                if pty.has_exited() {
                    running = false;
                }
            }

            _ = sigwinch.recv() => {
                if let Some((rows, cols)) = pty::terminal_size() {
                    let _ = pty.resize(rows, cols);
                }
            }
        }
    }

    // PTY first so nothing more is scraped, then the relay so it cannot
    // reconnect behind us.
    pending_enters.clear();
    pty.shutdown();
    client.close().await;
    hook_server.abort();
    hook_worker.abort();
    drop(pid_file);
    drop(raw_mode);

    events.emit(LifecycleEvent::SessionEnded { session_id: pairing.session_id.clone() });
    eprintln!("\r\n[cc-bridge] session ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use serde_json::json;

    use super::*;
    use crate::hooks::StatusUpdate;
    use crate::protocol::{permission_options, AgentStatus};

    fn bridge(hooks_installed: bool) -> SessionBridge {
        SessionBridge::new(OutputAggregator::default(), SourceArbiter::new(hooks_installed))
    }

    fn message_kinds(envelopes: &[Envelope]) -> Vec<MessageKind> {
        envelopes
            .iter()
            .filter_map(|envelope| match envelope {
                Envelope::Message { message } => Some(message.kind.clone()),
                _ => None,
            })
            .collect()
    }

    fn bash_call(command: &str) -> IngestedEvent {
        let input = serde_json::from_value(json!({
            "hook_event_name": "PreToolUse",
            "tool_name": "Bash",
            "tool_input": {"command": command}
        }))
        .unwrap();
        crate::hooks::ingest(&input).unwrap()
    }

    fn permission_prompt(text: &str) -> IngestedEvent {
        let input = serde_json::from_value(json!({
            "hook_event_name": "Notification",
            "notification_type": "permission_prompt",
            "message": text
        }))
        .unwrap();
        crate::hooks::ingest(&input).unwrap()
    }

    #[test]
    fn decoder_joins_split_characters() {
        let mut decoder = Utf8Decoder::default();
        let bytes = "é⏺".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..3]), "é");
        assert_eq!(decoder.decode(&bytes[3..]), "⏺");
        assert_eq!(decoder.decode(b"ok\xffok"), "ok\u{FFFD}ok");
    }

    #[test]
    fn scraped_output_is_deduplicated() {
        let mut bridge = bridge(false);
        let now = Instant::now();
        bridge.push_output("⏺ All tests pass.\n");
        assert_eq!(message_kinds(&bridge.on_quiet(now)), [MessageKind::AgentReply]);
        bridge.push_output("⏺ All tests pass.\n");
        assert!(bridge.on_quiet(now).is_empty());
    }

    #[test]
    fn hook_events_suppress_scraping_except_selections() {
        let mut bridge = bridge(false);
        let now = Instant::now();
        let event = IngestedEvent {
            message: Some(SemanticMessage::new(MessageKind::AgentReply, "Done.")),
            status: Some(StatusUpdate {
                status: AgentStatus::Idle,
                message: None,
            }),
        };
        let envelopes = bridge.on_hook_event(event, now);
        assert_eq!(envelopes.len(), 2);
        assert!(matches!(
            envelopes[0],
            Envelope::Status {
                status: AgentStatus::Idle,
                ..
            }
        ));
        assert!(matches!(envelopes[1], Envelope::Message { .. }));

        bridge.push_output("⏺ Something scraped\nPick a branch?\n1. main\n2. dev\n");
        let later = now + Duration::from_secs(1);
        assert_eq!(message_kinds(&bridge.on_quiet(later)), [MessageKind::SelectionDialog]);
    }

    #[test]
    fn repeated_hook_events_each_reach_the_viewer() {
        let mut hooked = bridge(true);
        let now = Instant::now();
        let events = [
            bash_call("cargo build"),
            bash_call("rm -rf target"),
            permission_prompt("Claude needs your permission to use Bash"),
            permission_prompt("Claude needs your permission to use Bash"),
        ];
        let mut contents = Vec::new();
        for event in events {
            for envelope in hooked.on_hook_event(event, now) {
                if let Envelope::Message { message } = envelope {
                    contents.push(message.content);
                }
            }
        }
        assert_eq!(
            contents,
            [
                "Bash(cargo build)",
                "Bash(rm -rf target)",
                "Claude needs your permission to use Bash",
                "Claude needs your permission to use Bash",
            ]
        );
        assert_eq!(
            hooked.outstanding().map(|m| m.kind.clone()),
            Some(MessageKind::PermissionRequest)
        );

        // The scraped redraw of the same call collapses into the hook copy.
        let mut scraping = bridge(false);
        scraping.on_hook_event(bash_call("cargo build"), now);
        scraping.push_output("⏺ Bash(cargo build)\n");
        assert!(scraping.on_quiet(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn viewer_option_ids_map_to_replies() {
        let mut bridge = bridge(true);
        let prompt = SemanticMessage::new(MessageKind::PermissionRequest, "Allow Bash?")
            .with_options(permission_options());
        bridge.on_hook_event(
            IngestedEvent {
                message: Some(prompt),
                status: None,
            },
            Instant::now(),
        );
        assert!(bridge.outstanding().is_some());
        assert_eq!(bridge.reply_for_input("always").as_deref(), Some("a"));
        assert!(bridge.outstanding().is_none());
        assert_eq!(bridge.reply_for_input("always").as_deref(), Some("always"));
        assert_eq!(bridge.reply_for_input("  ls -la \n").as_deref(), Some("ls -la"));
        assert_eq!(bridge.reply_for_input("   "), None);
    }

    #[test]
    fn reply_for_option_uses_action_mapping() {
        let options = permission_options();
        let replies: Vec<_> = options.iter().map(reply_for_option).collect();
        assert_eq!(replies, ["y", "n", "a"]);
    }
}
