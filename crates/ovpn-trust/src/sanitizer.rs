//! Configuration Sanitizer
//!
//! OpenVPN configs can name external commands to run on connection events.
//! Harmless for an unprivileged OpenVPN, fatal for one started by the
//! helper: the config is user-controlled, the commands would run as root.
//!
//! # Matching
//!
//! Lines are split into words the way OpenVPN's own parser splits them, so
//! quoting (`"up"`, `'up'`) and backslash escapes (`u\p`) cannot disguise a
//! directive. The first word, with an optional leading `--`, is the
//! directive name. A directive is dangerous when its name equals one of the
//! set's tokens, so `up` matches `up /tmp/x.sh` but not `up-delay`.
//!
//! A line holding only `<name>` opens an inline block, which OpenVPN reads
//! as directive `name` with the block as its argument. The tag itself is
//! checked; the block's lines are data, except inside `<connection>`.
//!
//! # Reading
//!
//! The file is read once, from a regular file only, up to
//! [`MAX_CONFIG_LEN`] bytes. [`ConfigSanitizer::load`] hands back exactly
//! the bytes that passed, so callers never re-read a path that may have
//! changed since.

use nix::fcntl::OFlag;
use ovpn_protocol::HelperError;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use tracing::{debug, warn};

/// Largest configuration accepted, inline certificates included
pub const MAX_CONFIG_LEN: u64 = 1024 * 1024;

/// Directives that make OpenVPN run external code
pub const DEFAULT_DANGEROUS_COMMANDS: &[&str] = &[
    "up",
    "tls-verify",
    "ipchange",
    "client-connect",
    "route-up",
    "route-pre-down",
    "client-disconnect",
    "down",
    "learn-address",
    "auth-user-pass-verify",
    "plugin",
];

/// Immutable set of forbidden directive names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DangerousCommandSet {
    tokens: BTreeSet<String>,
}

impl DangerousCommandSet {
    /// Default set extended with `extra` tokens
    ///
    /// Defaults can only be added to, never removed.
    pub fn with_extra<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::default();
        for token in extra {
            let token = token.as_ref().trim().trim_start_matches("--");
            if !token.is_empty() {
                set.tokens.insert(token.to_string());
            }
        }
        set
    }

    /// Is `directive` forbidden?
    pub fn contains(&self, directive: &str) -> bool {
        self.tokens.contains(directive)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Default for DangerousCommandSet {
    fn default() -> Self {
        Self {
            tokens: DEFAULT_DANGEROUS_COMMANDS
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

/// Checks configuration files before they reach OpenVPN
#[derive(Debug, Clone, Default)]
pub struct ConfigSanitizer {
    commands: DangerousCommandSet,
}

impl ConfigSanitizer {
    /// Create a sanitizer for a command set
    pub fn new(commands: DangerousCommandSet) -> Self {
        Self { commands }
    }

    /// Forbidden directives
    pub fn commands(&self) -> &DangerousCommandSet {
        &self.commands
    }

    /// Read, decode and scan the file at `path`
    pub fn sanitize(&self, path: &Path) -> Result<(), HelperError> {
        self.load(path).map(|_| ())
    }

    /// Like [`sanitize`](Self::sanitize), returning the bytes that passed
    pub fn load(&self, path: &Path) -> Result<Vec<u8>, HelperError> {
        let bytes = read_config(path).map_err(|e| {
            warn!("Cannot read configuration {}: {}", path.display(), e);
            HelperError::UnreadableConfigurationFile
        })?;

        self.check_bytes(&bytes)?;
        Ok(bytes)
    }

    /// Decode and scan raw configuration bytes
    pub fn check_bytes(&self, bytes: &[u8]) -> Result<(), HelperError> {
        let text = std::str::from_utf8(bytes).map_err(|e| {
            warn!("Configuration is not UTF-8: {}", e);
            HelperError::UnexpectedEncodingConfigurationFile
        })?;

        let found = self.scan(text);
        if found.is_empty() {
            debug!("Configuration passed sanitizer");
            Ok(())
        } else {
            warn!("Configuration contains dangerous commands: {}", found.join(", "));
            Err(HelperError::DangerousCommandsInConfigurationFile(found))
        }
    }

    /// Dangerous directives in `text`, in order of first occurrence
    pub fn scan(&self, text: &str) -> Vec<String> {
        let mut found: Vec<String> = Vec::new();
        let mut in_block = false;

        for line in text.lines() {
            let line = line.trim_start_matches('\u{feff}');

            if in_block {
                in_block = !line.trim_start().starts_with("</");
                continue;
            }

            let words = split_words(line);
            let Some(first) = words.first() else {
                continue;
            };

            let directive = match inline_tag(first) {
                Some(_) if words.len() > 1 => first.as_str(),
                Some(Tag::Close) => continue,
                // `<connection>` holds directives, other blocks hold data
                Some(Tag::Open("connection")) => continue,
                Some(Tag::Open(name)) => {
                    in_block = true;
                    name
                }
                None => first.as_str(),
            };
            let directive = strip_dashes(directive);

            if self.commands.contains(directive) && !found.iter().any(|f| f == directive) {
                found.push(directive.to_string());
            }
        }

        found
    }
}

/// Open a regular file without following a final symlink or blocking on a
/// FIFO, and read at most [`MAX_CONFIG_LEN`] bytes
fn read_config(path: &Path) -> io::Result<Vec<u8>> {
    let not_regular = || io::Error::new(io::ErrorKind::InvalidInput, "not a regular file");

    if !std::fs::symlink_metadata(path)?.file_type().is_file() {
        return Err(not_regular());
    }

    let file = OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits())
        .open(path)?;

    // The path may have been replaced between the lstat and the open
    let metadata = file.metadata()?;
    if !metadata.file_type().is_file() {
        return Err(not_regular());
    }

    let too_large = || {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("larger than {} bytes", MAX_CONFIG_LEN),
        )
    };
    if metadata.len() > MAX_CONFIG_LEN {
        return Err(too_large());
    }

    let mut bytes = Vec::with_capacity(metadata.len() as usize);
    file.take(MAX_CONFIG_LEN + 1).read_to_end(&mut bytes)?;
    if bytes.len() as u64 > MAX_CONFIG_LEN {
        return Err(too_large());
    }
    Ok(bytes)
}

#[derive(Debug, PartialEq, Eq)]
enum Tag<'a> {
    Open(&'a str),
    Close,
}

fn inline_tag(word: &str) -> Option<Tag<'_>> {
    let inner = word.strip_prefix('<')?.strip_suffix('>')?;
    if inner.starts_with('/') {
        Some(Tag::Close)
    } else if inner.is_empty() {
        None
    } else {
        Some(Tag::Open(inner))
    }
}

/// OpenVPN drops a leading `--` from names of three characters or more
fn strip_dashes(name: &str) -> &str {
    match name.strip_prefix("--") {
        Some(rest) if !rest.is_empty() => rest,
        _ => name,
    }
}

/// Split a line into words as OpenVPN's config parser does
///
/// Double quotes group and still honour backslashes; single quotes group
/// verbatim. Outside single quotes a backslash makes the next character
/// literal. `#` or `;` where a word would start comments out the rest.
/// An unterminated word is kept.
fn split_words(line: &str) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum State {
        Between,
        Bare,
        Double,
        Single,
    }

    let mut words = Vec::new();
    let mut word = String::new();
    let mut state = State::Between;
    let mut escaped = false;

    for c in line.chars() {
        if !escaped && c == '\\' && state != State::Single {
            escaped = true;
            continue;
        }

        let ends_word = match state {
            State::Between => {
                if c == '#' || c == ';' {
                    break;
                }
                if !c.is_whitespace() {
                    state = match c {
                        '"' if !escaped => State::Double,
                        '\'' if !escaped => State::Single,
                        _ => {
                            word.push(c);
                            State::Bare
                        }
                    };
                }
                escaped = false;
                continue;
            }
            State::Bare => !escaped && c.is_whitespace(),
            State::Double => !escaped && c == '"',
            State::Single => c == '\'',
        };

        if ends_word {
            words.push(std::mem::take(&mut word));
            state = State::Between;
        } else {
            word.push(c);
        }
        escaped = false;
    }

    if state != State::Between {
        words.push(word);
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CLEAN: &str = "\
client
dev tun
proto udp
remote vpn.example.org 1194
up-delay
route-delay 2
<ca>
-----BEGIN CERTIFICATE-----
up
-----END CERTIFICATE-----
</ca>
verb 3
";

    fn sanitizer() -> ConfigSanitizer {
        ConfigSanitizer::default()
    }

    #[test]
    fn test_clean_config_passes() {
        assert!(sanitizer().check_bytes(CLEAN.as_bytes()).is_ok());
    }

    #[test]
    fn test_shell_execution_rejected() {
        let config = format!("{}up /tmp/evil.sh\n", CLEAN);
        assert_eq!(
            sanitizer().check_bytes(config.as_bytes()),
            Err(HelperError::DangerousCommandsInConfigurationFile(vec!["up".to_string()]))
        );
    }

    #[test]
    fn test_order_of_first_occurrence() {
        let config = "\
route-up /tmp/a.sh
client
down /tmp/b.sh
route-up /tmp/c.sh
  --tls-verify /tmp/d.sh
";
        assert_eq!(sanitizer().scan(config), vec!["route-up", "down", "tls-verify"]);
    }

    #[test]
    fn test_comments_ignored() {
        let config = "# up /tmp/a.sh\n; down /tmp/b.sh\nclient\n";
        assert!(sanitizer().scan(config).is_empty());
    }

    #[test]
    fn test_inline_blocks_skipped() {
        let config = "<tls-auth>\nplugin\n</tls-auth>\nplugin /usr/lib/evil.so\n";
        assert_eq!(sanitizer().scan(config), vec!["plugin"]);
    }

    #[test]
    fn test_connection_blocks_scanned() {
        let config = "<connection>\nremote a.example.org\nup /tmp/a.sh\n</connection>\n";
        assert_eq!(sanitizer().scan(config), vec!["up"]);
    }

    #[test]
    fn test_crlf_and_bom() {
        let config = "\u{feff}up /tmp/a.sh\r\nclient\r\n";
        assert_eq!(sanitizer().scan(config), vec!["up"]);
    }

    #[test]
    fn test_encoding_checked_before_scan() {
        let mut bytes = b"up /tmp/a.sh\n".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, 0x00]);

        assert_eq!(
            sanitizer().check_bytes(&bytes),
            Err(HelperError::UnexpectedEncodingConfigurationFile)
        );
    }

    #[test]
    fn test_unreadable_file() {
        assert_eq!(
            sanitizer().sanitize(Path::new("/nonexistent/eduvpn-xyz.ovpn")),
            Err(HelperError::UnreadableConfigurationFile)
        );
    }

    #[test]
    fn test_sanitize_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"client\nlearn-address /tmp/x\n").unwrap();

        assert_eq!(
            sanitizer().sanitize(file.path()),
            Err(HelperError::DangerousCommandsInConfigurationFile(vec![
                "learn-address".to_string()
            ]))
        );
    }

    #[test]
    fn test_quoted_and_escaped_directives() {
        let config = "\
\"up\" /tmp/a.sh
'route-up' /tmp/b.sh
u\\p /tmp/c.sh
\"--down\" /tmp/d.sh
pl\\\"ugin x
";
        assert_eq!(sanitizer().scan(config), vec!["up", "route-up", "down"]);
        assert_eq!(sanitizer().scan("'tls-\\verify' x\n"), Vec::<String>::new());
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"  remote "a b" 'c\d' e\ f # x"#),
            ["remote", "a b", r"c\d", "e f"]
        );
        assert_eq!(split_words("\"up"), ["up"]);
        assert!(split_words(" ; up").is_empty());
        assert!(split_words("\\#up").is_empty());
    }

    #[test]
    fn test_inline_tag_is_directive() {
        let config = "client\n<up>\n/bin/sh -c id\n</up>\n";
        assert_eq!(sanitizer().scan(config), vec!["up"]);

        let config = "'<learn-address>'\nx\n</learn-address>\n";
        assert_eq!(sanitizer().scan(config), vec!["learn-address"]);
    }

    #[test]
    fn test_tag_with_arguments_is_not_a_block() {
        let config = "<ca> junk\nup /tmp/a.sh\n";
        assert_eq!(sanitizer().scan(config), vec!["up"]);
    }

    #[test]
    fn test_fifo_rejected_without_blocking() {
        let dir = tempfile::TempDir::new().unwrap();
        let fifo = dir.path().join("eduvpn.ovpn");
        nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

        assert_eq!(
            sanitizer().sanitize(&fifo),
            Err(HelperError::UnreadableConfigurationFile)
        );
    }

    #[test]
    fn test_symlink_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("real.ovpn");
        std::fs::write(&target, "client\n").unwrap();
        let link = dir.path().join("eduvpn.ovpn");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(sanitizer().sanitize(&target).is_ok());
        assert_eq!(
            sanitizer().sanitize(&link),
            Err(HelperError::UnreadableConfigurationFile)
        );
    }

    #[test]
    fn test_oversized_file_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        let line = b"# padding padding padding padding padding padding padding\n";
        let mut written = 0u64;
        while written <= MAX_CONFIG_LEN {
            file.write_all(line).unwrap();
            written += line.len() as u64;
        }

        assert_eq!(
            sanitizer().sanitize(file.path()),
            Err(HelperError::UnreadableConfigurationFile)
        );
    }

    #[test]
    fn test_load_returns_checked_bytes() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"client\ndev tun\n").unwrap();

        assert_eq!(sanitizer().load(file.path()).unwrap(), b"client\ndev tun\n");
    }

    #[test]
    fn test_extra_commands_extend_defaults() {
        let set = DangerousCommandSet::with_extra(["--setenv", " ", "route-pre-down"]);

        assert!(set.contains("setenv"));
        assert!(set.contains("up"));
        assert_eq!(set.len(), DEFAULT_DANGEROUS_COMMANDS.len() + 1);
        assert!(!set.is_empty());

        let sanitizer = ConfigSanitizer::new(set);
        assert_eq!(sanitizer.scan("setenv FOO bar\n"), vec!["setenv"]);
    }
}
