//! Agent-side half of the permission protocol: the settings file that points the
//! agent's `PreToolUse` hook at this binary, and the `hook` forwarder it runs.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{json, Value};

use crate::permission::HookResponse;

/// Header carrying the daemon-side session id on forwarded hook calls.
pub const SESSION_HEADER: &str = "x-boba-session-id";
/// Environment variable the launcher sets on each agent process.
pub const SESSION_ENV_VAR: &str = "BOBA_SESSION_ID";

const HOOK_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);
const FORWARD_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSettings {
    pub command: String,
    pub timeout_secs: u64,
}

impl HookSettings {
    /// Settings whose hook runs `<exe> hook --port <port>`.
    ///
    /// The hook timeout stays above the permission timeout so the agent never
    /// abandons a call the daemon is still going to answer.
    pub fn for_forwarder(exe: &Path, hook_port: u16, permission_timeout: Duration) -> Self {
        let timeout = permission_timeout + HOOK_TIMEOUT_MARGIN;
        Self {
            command: format!(
                "{} hook --port {hook_port} --timeout-ms {}",
                shell_quote(&exe.to_string_lossy()),
                permission_timeout.as_millis()
            ),
            timeout_secs: timeout.as_secs().max(1),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "hooks": {
                "PreToolUse": [
                    {
                        "matcher": "*",
                        "hooks": [
                            {
                                "type": "command",
                                "command": self.command,
                                "timeout": self.timeout_secs,
                            }
                        ]
                    }
                ]
            }
        })
    }
}

/// Where settings live for an agent working directory.
#[derive(Debug, Clone)]
pub struct HookInstall {
    pub data_dir: PathBuf,
    pub settings: HookSettings,
}

impl HookInstall {
    pub fn ensure(&self, cwd: &Path) -> io::Result<PathBuf> {
        ensure_settings(&self.data_dir, cwd, &self.settings)
    }
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir().unwrap_or_else(std::env::temp_dir)
}

pub fn settings_path(data_dir: &Path, cwd: &Path) -> PathBuf {
    data_dir
        .join("boba-daemon")
        .join("hooks")
        .join(sanitize_cwd(cwd))
        .join("settings.json")
}

/// Writes the settings file for `cwd` unless an identical one already exists.
pub fn ensure_settings(data_dir: &Path, cwd: &Path, settings: &HookSettings) -> io::Result<PathBuf> {
    let path = settings_path(data_dir, cwd);
    let mut contents = serde_json::to_string_pretty(&settings.to_json())?;
    contents.push('\n');

    if fs::read_to_string(&path).ok().as_deref() == Some(contents.as_str()) {
        tracing::debug!(path = %path.display(), "hook settings up to date");
        return Ok(path);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), cwd = %cwd.display(), "wrote hook settings");
    Ok(path)
}

fn sanitize_cwd(cwd: &Path) -> String {
    let sanitized: String = cwd
        .to_string_lossy()
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' { ch } else { '-' })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.to_string()
    }
}

fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "/._-".contains(ch))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Forwards one hook invocation to the daemon and returns the body to print.
///
/// Fails closed: any transport or decoding problem yields a `deny` decision.
/// Uses the blocking client, so it must not run on an async runtime thread.
pub fn forward_hook(
    input: &str,
    base_url: &str,
    session_id: Option<&str>,
    permission_timeout: Duration,
) -> String {
    let deny = |reason: String| {
        tracing::warn!(reason = %reason, "hook forwarder denying tool call");
        serde_json::to_string(&HookResponse::decision(false, reason))
            .unwrap_or_else(|_| String::from("{}"))
    };

    let payload: Value = match serde_json::from_str(input) {
        Ok(payload) => payload,
        Err(err) => return deny(format!("invalid hook input: {err}")),
    };

    let client = match reqwest::blocking::Client::builder()
        .timeout(permission_timeout + FORWARD_TIMEOUT_MARGIN)
        .build()
    {
        Ok(client) => client,
        Err(err) => return deny(format!("failed to build http client: {err}")),
    };

    let mut request = client
        .post(format!("{}/permission", base_url.trim_end_matches('/')))
        .json(&payload);
    if let Some(session_id) = session_id.filter(|id| !id.is_empty()) {
        request = request.header(SESSION_HEADER, session_id);
    }

    let response = match request.send() {
        Ok(response) => response,
        Err(err) => return deny(format!("boba-daemon unreachable: {err}")),
    };
    let status = response.status();
    let body = match response.text() {
        Ok(body) => body,
        Err(err) => return deny(format!("failed to read daemon response: {err}")),
    };
    if !status.is_success() {
        return deny(format!("boba-daemon answered {status}: {body}"));
    }
    body
}
