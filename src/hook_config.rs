//! Hook entries in the agent's settings file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

pub const HOOK_BINARY: &str = "cc-bridge-hook";
const HOOK_TIMEOUT_SECS: u64 = 5;

/// `~/.claude/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".claude").join("settings.json"))
}

/// The forwarder binary installed next to the running executable, or the
/// bare name for `$PATH` lookup.
pub fn hook_command_path() -> String {
    std::env::current_exe()
        .ok()
        .map(|exe| exe.with_file_name(HOOK_BINARY))
        .filter(|candidate| candidate.is_file())
        .map(|candidate| candidate.to_string_lossy().into_owned())
        .unwrap_or_else(|| HOOK_BINARY.to_string())
}

fn command_hook(program: &str, args: &str) -> Value {
    json!({
        "type": "command",
        "command": format!("\"{program}\" {args}"),
        "timeout": HOOK_TIMEOUT_SECS,
    })
}

fn matcher_group(matcher: Option<&str>, program: &str, args: &str) -> Value {
    let mut group = Map::new();
    if let Some(matcher) = matcher {
        group.insert("matcher".into(), json!(matcher));
    }
    group.insert("hooks".into(), json!([command_hook(program, args)]));
    Value::Object(group)
}

/// The `hooks` object the bridge needs, keyed by agent event name.
pub fn generate_hooks_config(program: &str) -> Value {
    json!({
        "Stop": [matcher_group(None, program, "stop")],
        "Notification": [
            matcher_group(Some("permission_prompt"), program, "notification permission"),
            matcher_group(Some("idle_prompt"), program, "notification idle"),
            matcher_group(Some("elicitation_dialog"), program, "notification elicitation"),
        ],
        "PreToolUse": [matcher_group(Some("*"), program, "pre-tool")],
        "PostToolUse": [matcher_group(Some("*"), program, "post-tool")],
        "UserPromptSubmit": [matcher_group(None, program, "user-prompt")],
    })
}

fn read_settings(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if raw.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("{} does not contain a JSON object", path.display()),
    }
}

/// True when the settings file carries a `hooks.Stop` entry.
pub fn hooks_installed(path: &Path) -> bool {
    read_settings(path)
        .ok()
        .and_then(|settings| settings.get("hooks").cloned())
        .is_some_and(|hooks| hooks.get("Stop").is_some())
}

/// Merge the bridge hooks into the settings file, keeping every other key
/// and any hooks for events the bridge does not use. An existing file is
/// copied to `<name>.backup` first.
pub fn install_hooks(path: &Path, program: &str) -> Result<()> {
    let mut settings = read_settings(path)?;
    if path.exists() {
        let backup = backup_path(path);
        std::fs::copy(path, &backup)
            .with_context(|| format!("failed to back up settings to {}", backup.display()))?;
    }

    let hooks = settings
        .entry("hooks")
        .or_insert_with(|| Value::Object(Map::new()));
    if !hooks.is_object() {
        *hooks = Value::Object(Map::new());
    }
    if let (Some(existing), Value::Object(ours)) =
        (hooks.as_object_mut(), generate_hooks_config(program))
    {
        existing.extend(ours);
    }

    write_pretty(path, &Value::Object(settings))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".backup");
    path.with_file_name(name)
}

fn write_pretty(path: &Path, value: &Value) -> Result<()> {
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage {}", path.display()))?;
    serde_json::to_writer_pretty(&mut file, value)?;
    file.write_all(b"\n")?;
    file.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
