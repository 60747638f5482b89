//! `cc-bridge-hook <event> [sub-type]`: run by the agent's hook system.
//! Forwards the hook payload on stdin to the session's loopback listener.

use std::io::IsTerminal;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;

use cc_bridge::hooks::{forwarded_event, stamp_payload, DEFAULT_HOOK_PORT, HOOK_PORT_ENV};

const STDIN_TIMEOUT: Duration = Duration::from_secs(1);
const POST_TIMEOUT: Duration = Duration::from_secs(3);

const USAGE: &str = "usage: cc-bridge-hook <stop|notification|pre-tool|post-tool|user-prompt> [permission|idle|elicitation]";

/// Whatever arrives within the timeout; `{}` for an interactive stdin.
async fn read_payload() -> Value {
    if std::io::stdin().is_terminal() {
        return Value::Object(Default::default());
    }
    let mut raw = Vec::new();
    let mut stdin = tokio::io::stdin();
    let _ = tokio::time::timeout(STDIN_TIMEOUT, stdin.read_to_end(&mut raw)).await;
    let text = String::from_utf8_lossy(&raw);
    if text.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(&text).unwrap_or_else(|_| Value::Object(Default::default()))
}

fn hook_port() -> u16 {
    std::env::var(HOOK_PORT_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(DEFAULT_HOOK_PORT)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let mut args = std::env::args().skip(1);
    let Some(event) = args.next() else {
        eprintln!("{USAGE}");
        std::process::exit(1);
    };
    let sub_type = args.next();
    let Some((name, notification_type)) = forwarded_event(&event, sub_type.as_deref()) else {
        eprintln!("unknown hook event: {event}");
        eprintln!("{USAGE}");
        std::process::exit(1);
    };

    let mut payload = read_payload().await;
    stamp_payload(&mut payload, name, notification_type);

    // No listener means no bridged session; the agent must never wait on us.
    let Ok(client) = reqwest::Client::builder().timeout(POST_TIMEOUT).build() else {
        return;
    };
    let url = format!("http://127.0.0.1:{}/hook", hook_port());
    let _ = client.post(&url).json(&payload).send().await;
}
