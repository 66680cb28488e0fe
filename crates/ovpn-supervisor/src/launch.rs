//! OpenVPN launch arguments
//!
//! Built only from a staged request, whose paths point at the verified
//! copies. OpenVPN reads its own configuration from `--config`; everything
//! else it needs (log file, management socket, scripts) is forced on the
//! command line so the config cannot redirect it.

use ovpn_protocol::StartRequest;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// A process to spawn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Absolute path of the executable
    pub program: PathBuf,
    /// Arguments, not including the program
    pub args: Vec<OsString>,
    /// Put the process in its own process group
    pub own_process_group: bool,
}

impl CommandSpec {
    /// Command that runs in the helper's process group
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            own_process_group: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Position of an argument, if present
    pub fn position(&self, arg: &str) -> Option<usize> {
        self.args.iter().position(|a| a == arg)
    }

    /// Value following a flag
    pub fn value_of(&self, flag: &str) -> Option<&OsStr> {
        self.position(flag)
            .and_then(|i| self.args.get(i + 1))
            .map(|v| v.as_os_str())
    }
}

/// Log file next to the configuration (`<config>.log`)
pub fn log_path(config: &Path) -> PathBuf {
    let mut path = config.as_os_str().to_os_string();
    path.push(".log");
    PathBuf::from(path)
}

/// Escape a word for OpenVPN's command-line parser
///
/// OpenVPN splits `--up`/`--down` values on whitespace and honours
/// backslash escapes, so paths with spaces (app bundles) must be escaped.
pub fn escape_word(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if c.is_whitespace() || matches!(c, '\\' | '"' | '\'') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `--up`/`--down` value: the script followed by its options
pub fn script_command(script: &Path, options: &[String]) -> String {
    let mut command = escape_word(&script.to_string_lossy());
    for option in options {
        command.push(' ');
        command.push_str(&escape_word(option));
    }
    command
}

/// Full OpenVPN invocation for a staged request, logging to `log`
pub fn openvpn_command(
    request: &StartRequest,
    log: &Path,
    management_socket: &Path,
) -> CommandSpec {
    let mut spec = CommandSpec::new(&request.launch_path)
        .arg("--config")
        .arg(&request.config_path)
        .arg("--log")
        .arg(log)
        .arg("--management")
        .arg(management_socket)
        .arg("unix")
        .arg("--management-external-key")
        .arg("--management-external-cert")
        .arg("macosx-keychain")
        .arg("--management-query-passwords")
        .arg("--management-forget-disconnect");

    if let Some(up) = &request.up_script {
        spec = spec
            .arg("--up")
            .arg(script_command(up, &request.script_options));
    }
    if let Some(down) = &request.down_script {
        spec = spec
            .arg("--down")
            .arg(script_command(down, &request.script_options));
    }
    if request.has_scripts() {
        spec = spec.arg("--script-security").arg("2");
    }

    spec.own_process_group = true;
    spec
}
