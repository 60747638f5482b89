use anyhow::{Context, Result};
use clap::Parser;

use cc_bridge::config::{Cli, Command, InstallHooksArgs, KillArgs, SettingsArgs};
use cc_bridge::events::init_logging;
use cc_bridge::hook_config::{generate_hooks_config, hook_command_path, hooks_installed, install_hooks};
use cc_bridge::runtime::{KillOutcome, SessionRegistry};
use cc_bridge::session;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start(args) => {
            init_logging(&args.log_level);
            session::run_start(args).await
        }
        Command::InstallHooks(args) => {
            init_logging("warn");
            run_install_hooks(args)
        }
        Command::CheckHooks(args) => {
            init_logging("warn");
            run_check_hooks(args)
        }
        Command::Kill(args) => {
            init_logging("warn");
            run_kill(args)
        }
        Command::Status => {
            init_logging("warn");
            run_status()
        }
    }
}

fn settings_path(args: &SettingsArgs) -> Result<std::path::PathBuf> {
    args.resolve()
        .context("cannot determine home directory; pass --settings")
}

fn run_install_hooks(args: InstallHooksArgs) -> Result<()> {
    let program = hook_command_path();
    if args.show {
        let block = serde_json::json!({ "hooks": generate_hooks_config(&program) });
        println!("{}", serde_json::to_string_pretty(&block)?);
        return Ok(());
    }

    let path = settings_path(&args.settings)?;
    if hooks_installed(&path) {
        println!("Hooks already present in {}; refreshing them.", path.display());
    }
    install_hooks(&path, &program)?;
    println!("Installed cc-bridge hooks into {}", path.display());
    println!("Restart the agent for the hooks to take effect.");
    Ok(())
}

fn run_check_hooks(args: SettingsArgs) -> Result<()> {
    let path = settings_path(&args)?;
    if hooks_installed(&path) {
        println!("Hooks are installed in {}", path.display());
    } else {
        println!("Hooks are not installed. Run `cc-bridge install-hooks`.");
    }
    Ok(())
}

fn run_kill(args: KillArgs) -> Result<()> {
    let registry = SessionRegistry::default_location()?;
    match registry.kill(args.port)? {
        KillOutcome::NotRecorded => println!("No session recorded on port {}", args.port),
        KillOutcome::Stale { pid } => {
            println!("Session on port {} (pid {pid}) had already exited", args.port)
        }
        KillOutcome::Signalled { pid } => {
            println!("Stopped session on port {} (pid {pid})", args.port)
        }
    }
    Ok(())
}

fn run_status() -> Result<()> {
    let registry = SessionRegistry::default_location()?;
    let pruned = registry.prune();
    let sessions = registry.list();
    if sessions.is_empty() {
        println!("No running sessions");
    }
    for entry in sessions {
        println!("port {:<6} pid {}", entry.port, entry.pid);
    }
    if pruned > 0 {
        println!("Removed {pruned} stale record(s)");
    }
    Ok(())
}
