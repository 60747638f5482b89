use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::hooks::DEFAULT_HOOK_PORT;

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8787";

#[derive(Debug, Parser, Clone)]
#[command(name = "cc-bridge")]
#[command(about = "Mirrors a terminal coding session to a paired viewer through a relay")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Start a bridged shell session and print its pairing code
    Start(StartArgs),
    /// Add the bridge hooks to the agent's settings file
    InstallHooks(InstallHooksArgs),
    /// Report whether the bridge hooks are installed
    CheckHooks(SettingsArgs),
    /// Stop the session recorded for a hook port
    Kill(KillArgs),
    /// List recorded sessions
    Status,
}

#[derive(Debug, Args, Clone)]
pub struct StartArgs {
    /// Session name shown to the viewer (defaults to the directory name)
    #[arg(short, long)]
    pub name: Option<String>,

    /// Relay server URL
    #[arg(short, long, env = "CC_BRIDGE_SERVER", default_value = DEFAULT_SERVER_URL)]
    pub server: String,

    /// Loopback port for hook events
    #[arg(short, long, env = "CC_BRIDGE_HOOK_PORT", default_value_t = DEFAULT_HOOK_PORT)]
    pub port: u16,

    /// Shell to run (defaults to $SHELL)
    #[arg(long)]
    pub shell: Option<String>,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Emit lifecycle events as JSON lines on stderr
    #[arg(long, default_value_t = false)]
    pub json_events: bool,

    /// Seconds to wait for the first relay connection
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,
}

#[derive(Debug, Args, Clone)]
pub struct SettingsArgs {
    /// Agent settings file (defaults to ~/.claude/settings.json)
    #[arg(long)]
    pub settings: Option<PathBuf>,
}

impl SettingsArgs {
    pub fn resolve(&self) -> Option<PathBuf> {
        self.settings
            .clone()
            .or_else(crate::hook_config::default_settings_path)
    }
}

#[derive(Debug, Args, Clone)]
pub struct InstallHooksArgs {
    /// Print the hooks block instead of writing it
    #[arg(long, default_value_t = false)]
    pub show: bool,

    #[command(flatten)]
    pub settings: SettingsArgs,
}

#[derive(Debug, Args, Clone)]
pub struct KillArgs {
    #[arg(short, long, default_value_t = DEFAULT_HOOK_PORT)]
    pub port: u16,
}

#[derive(Debug, Parser, Clone)]
#[command(name = "cc-bridge-relay")]
#[command(about = "Pairs cc-bridge sessions with their viewers")]
#[command(version)]
pub struct RelayServerConfig {
    #[arg(long, env = "CC_BRIDGE_RELAY_LISTEN", default_value = "0.0.0.0:8787")]
    pub listen: SocketAddr,

    /// Seconds a session with no open sockets survives before eviction.
    #[arg(long, env = "CC_BRIDGE_RELAY_IDLE_SECS", default_value_t = 600)]
    pub idle_secs: u64,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}
