//! `${...}` substitution for session files.
//!
//! Generated values (ports, tokens) are fixed for the life of a session;
//! captures are filled in as stages become ready and shared with every
//! later stage and every teardown.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;

use crate::{AppError, Result};

/// Lowest generated port.
pub const PORT_RANGE_START: u16 = 8192;
/// One past the highest generated port.
pub const PORT_RANGE_END: u16 = 24576;

const TOKEN_LEN: usize = 32;

const SSH_TARGET_PATTERN: &str = r"^(?:(?<user>[a-zA-Z0-9._-]+)@)?(?<host>(?:localhost|(?:[a-zA-Z0-9-]+\.)*[a-zA-Z0-9-]+|\d{1,3}(?:\.\d{1,3}){3}|\[(?:[0-9a-fA-F:]+)\]))(?::(?<port>6553[0-5]|655[0-2]\d|65[0-4]\d{2}|6[0-4]\d{3}|[1-5]?\d{1,4}))?$";

/// Parsed `[user@]host[:port]` SSH destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    raw: String,
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl SshTarget {
    /// Parse and validate a destination string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `raw` is not `[user@]host[:port]`.
    pub fn parse(raw: &str) -> Result<Self> {
        let pattern = Regex::new(SSH_TARGET_PATTERN)?;
        let caps = pattern
            .captures(raw)
            .ok_or_else(|| AppError::Validation(format!("invalid ssh target: {raw}")))?;

        let port = match caps.name("port") {
            Some(port) => Some(port.as_str().parse::<u16>().map_err(|err| {
                AppError::Validation(format!("invalid ssh target port in {raw}: {err}"))
            })?),
            None => None,
        };

        Ok(Self {
            raw: raw.to_owned(),
            user: caps.name("user").map(|m| m.as_str().to_owned()),
            host: caps
                .name("host")
                .map(|m| m.as_str().to_owned())
                .unwrap_or_default(),
            port,
        })
    }

    /// The destination exactly as given.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Login user, if one was given.
    #[must_use]
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Host name or address; IPv6 addresses keep their brackets.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// SSH port, if one was given.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.port
    }
}

impl FromStr for SshTarget {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// One `${...}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    /// `${port.NAME}`
    Port(String),
    /// `${token.NAME}`
    Token(String),
    /// `${target}`
    Target,
    /// `${target.host}`
    TargetHost,
    /// `${target.user}`
    TargetUser,
    /// `${temp_dir}`
    TempDir,
    /// `${capture.NAME}`
    Capture(String),
    /// `${env.NAME}`
    Env(String),
}

impl Reference {
    fn parse(body: &str) -> Result<Self> {
        let reference = match body.split_once('.') {
            None => match body {
                "target" => Self::Target,
                "temp_dir" => Self::TempDir,
                _ => return Err(unknown(body)),
            },
            Some(("target", "host")) => Self::TargetHost,
            Some(("target", "user")) => Self::TargetUser,
            Some((_, "")) => return Err(unknown(body)),
            Some(("port", name)) => Self::Port(name.to_owned()),
            Some(("token", name)) => Self::Token(name.to_owned()),
            Some(("capture", name)) => Self::Capture(name.to_owned()),
            Some(("env", name)) => Self::Env(name.to_owned()),
            Some(_) => return Err(unknown(body)),
        };
        Ok(reference)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Port(name) => write!(f, "${{port.{name}}}"),
            Self::Token(name) => write!(f, "${{token.{name}}}"),
            Self::Target => f.write_str("${target}"),
            Self::TargetHost => f.write_str("${target.host}"),
            Self::TargetUser => f.write_str("${target.user}"),
            Self::TempDir => f.write_str("${temp_dir}"),
            Self::Capture(name) => write!(f, "${{capture.{name}}}"),
            Self::Env(name) => write!(f, "${{env.{name}}}"),
        }
    }
}

fn unknown(body: &str) -> AppError {
    AppError::Validation(format!("unknown template reference ${{{body}}}"))
}

enum Piece<'a> {
    Text(&'a str),
    Ref(Reference),
}

fn pieces(template: &str) -> Result<Vec<Piece<'_>>> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        if start > 0 {
            out.push(Piece::Text(&rest[..start]));
        }
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            AppError::Validation(format!("unterminated template reference in {template:?}"))
        })?;
        out.push(Piece::Ref(Reference::parse(&after[..end])?));
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        out.push(Piece::Text(rest));
    }
    Ok(out)
}

/// Every reference in `template`, in order of appearance.
///
/// # Errors
///
/// Returns `AppError::Validation` on malformed or unknown references.
pub fn references(template: &str) -> Result<Vec<Reference>> {
    Ok(pieces(template)?
        .into_iter()
        .filter_map(|piece| match piece {
            Piece::Ref(reference) => Some(reference),
            Piece::Text(_) => None,
        })
        .collect())
}

/// Fail when `count` distinct ports cannot be drawn from the port range.
///
/// # Errors
///
/// Returns `AppError::Validation` when `count` exceeds the range size.
pub fn check_port_count(count: usize) -> Result<()> {
    let available = usize::from(PORT_RANGE_END - PORT_RANGE_START);
    if count > available {
        return Err(AppError::Validation(format!(
            "{count} ports requested but only {available} are available in {PORT_RANGE_START}..{PORT_RANGE_END}"
        )));
    }
    Ok(())
}

/// Values available to templates during one session.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    ports: BTreeMap<String, u16>,
    tokens: BTreeMap<String, String>,
    target: Option<SshTarget>,
    temp_dir: Option<PathBuf>,
    captures: Arc<Mutex<HashMap<String, String>>>,
}

impl Vars {
    /// Draw a distinct random port for each of `ports` and a random token
    /// for each of `tokens`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if more ports are requested than the
    /// range holds.
    pub fn generate(ports: &[String], tokens: &[String]) -> Result<Self> {
        check_port_count(ports.len())?;
        let mut rng = rand::thread_rng();
        let mut taken = HashSet::new();
        let mut vars = Self::default();

        for name in ports {
            let port = loop {
                let candidate = rng.gen_range(PORT_RANGE_START..PORT_RANGE_END);
                if taken.insert(candidate) {
                    break candidate;
                }
            };
            vars.ports.insert(name.clone(), port);
        }
        for name in tokens {
            let token: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(TOKEN_LEN)
                .map(char::from)
                .collect();
            vars.tokens.insert(name.clone(), token);
        }
        Ok(vars)
    }

    /// Set the SSH destination.
    #[must_use]
    pub fn with_target(mut self, target: Option<SshTarget>) -> Self {
        self.target = target;
        self
    }

    /// Set the session temp directory.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Bind `name` to `port`.
    #[must_use]
    pub fn with_port(mut self, name: impl Into<String>, port: u16) -> Self {
        self.ports.insert(name.into(), port);
        self
    }

    /// Bind `name` to `token`.
    #[must_use]
    pub fn with_token(mut self, name: impl Into<String>, token: impl Into<String>) -> Self {
        self.tokens.insert(name.into(), token.into());
        self
    }

    /// Generated port for `name`.
    #[must_use]
    pub fn port(&self, name: &str) -> Option<u16> {
        self.ports.get(name).copied()
    }

    /// Generated token for `name`.
    #[must_use]
    pub fn token(&self, name: &str) -> Option<&str> {
        self.tokens.get(name).map(String::as_str)
    }

    /// Session temp directory.
    #[must_use]
    pub fn temp_dir(&self) -> Option<&Path> {
        self.temp_dir.as_deref()
    }

    /// Record a value captured from a stage's output. Visible to every clone.
    pub fn set_capture(&self, name: impl Into<String>, value: impl Into<String>) {
        self.captures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Captured value for `name`.
    #[must_use]
    pub fn capture(&self, name: &str) -> Option<String> {
        self.captures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Substitute every reference in `template`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if a reference is malformed or has no
    /// value yet.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        for piece in pieces(template)? {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Ref(reference) => out.push_str(&self.resolve(&reference)?),
            }
        }
        Ok(out)
    }

    /// Render each of `templates`.
    ///
    /// # Errors
    ///
    /// See [`Vars::render`].
    pub fn render_all(&self, templates: &[String]) -> Result<Vec<String>> {
        templates.iter().map(|t| self.render(t)).collect()
    }

    fn resolve(&self, reference: &Reference) -> Result<String> {
        let missing = || AppError::Validation(format!("no value for {reference}"));
        match reference {
            Reference::Port(name) => self.port(name).map(|p| p.to_string()).ok_or_else(missing),
            Reference::Token(name) => self.token(name).map(str::to_owned).ok_or_else(missing),
            Reference::Target => self
                .target
                .as_ref()
                .map(|t| t.as_str().to_owned())
                .ok_or_else(missing),
            Reference::TargetHost => self
                .target
                .as_ref()
                .map(|t| t.host().to_owned())
                .ok_or_else(missing),
            Reference::TargetUser => self
                .target
                .as_ref()
                .and_then(SshTarget::user)
                .map(str::to_owned)
                .ok_or_else(missing),
            Reference::TempDir => self
                .temp_dir
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned())
                .ok_or_else(missing),
            Reference::Capture(name) => self.capture(name).ok_or_else(missing),
            Reference::Env(name) => std::env::var(name).map_err(|_| missing()),
        }
    }
}
