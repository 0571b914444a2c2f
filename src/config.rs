//! Session file parsing and validation.
//!
//! Everything a session file can get wrong is caught here, before the first
//! process spawns: unknown template references, captures used before the
//! stage that defines them, malformed regexes, and stage shapes that make no
//! sense (a task with a readiness pattern, a service with a teardown command).

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::models::stage::StageKind;
use crate::template::{check_port_count, references, Reference, SshTarget};
use crate::{AppError, Result};

fn default_cleanup_grace_ms() -> u64 {
    100
}

fn default_correlation_timeout_ms() -> u64 {
    100
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    30
}

/// Teardown and correlation timing.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TimingConfig {
    /// Pause before and after draining the cleanup stack.
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,
    /// How long a stage waits to observe its own spawn.
    #[serde(default = "default_correlation_timeout_ms")]
    pub correlation_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cleanup_grace_ms: default_cleanup_grace_ms(),
            correlation_timeout_ms: default_correlation_timeout_ms(),
        }
    }
}

impl TimingConfig {
    /// Cleanup grace as a duration.
    #[must_use]
    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    /// Correlation timeout as a duration.
    #[must_use]
    pub fn correlation_timeout(&self) -> Duration {
        Duration::from_millis(self.correlation_timeout_ms)
    }
}

/// Values generated once per session.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct GenerateConfig {
    /// Names bound to random free-range ports.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Names bound to random auth tokens.
    #[serde(default)]
    pub tokens: Vec<String>,
}

/// A file written into the session temp dir before a stage spawns.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    /// Path relative to the temp dir.
    pub path: String,
    /// File body.
    pub contents: String,
}

/// When a service stage counts as ready.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ReadinessConfig {
    /// Substring to look for.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Regex to look for.
    #[serde(default)]
    pub regex: Option<String>,
    /// Delay between polls.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Polls before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl ReadinessConfig {
    /// Delay between polls as a duration.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Value extracted from a stage's output once it is ready.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct CaptureConfig {
    /// Name later templates use as `${capture.NAME}`.
    pub name: String,
    /// Regex with exactly one capture group.
    pub regex: String,
}

/// Command run at teardown of a task stage.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TeardownConfig {
    /// Program to run.
    pub command: String,
    /// Its arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// One `[[stages]]` entry.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct StageConfig {
    /// Unique stage name.
    pub name: String,
    /// Service (long-running) or task (one-shot).
    #[serde(default)]
    pub kind: StageKind,
    /// Program to run.
    pub command: String,
    /// Its arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Files written before spawn.
    #[serde(default)]
    pub files: Vec<FileConfig>,
    /// Readiness pattern; services only.
    #[serde(default)]
    pub readiness: Option<ReadinessConfig>,
    /// Output capture.
    #[serde(default)]
    pub capture: Option<CaptureConfig>,
    /// Teardown command; tasks only.
    #[serde(default)]
    pub teardown: Option<TeardownConfig>,
}

impl StageConfig {
    /// Templates evaluated when the stage starts.
    fn start_templates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .chain(self.env.values().map(String::as_str))
            .chain(
                self.files
                    .iter()
                    .flat_map(|file| [file.path.as_str(), file.contents.as_str()]),
            )
    }

    /// Templates evaluated at teardown.
    fn teardown_templates(&self) -> impl Iterator<Item = &str> {
        self.teardown.iter().flat_map(|teardown| {
            std::iter::once(teardown.command.as_str())
                .chain(teardown.args.iter().map(String::as_str))
        })
    }
}

/// A session file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SessionConfig {
    /// Session name, used in logs and the temp dir prefix.
    pub name: String,
    /// `[user@]host[:port]` destination for tunnel stages.
    #[serde(default)]
    pub ssh_target: Option<String>,
    /// Binaries that must resolve on `PATH`.
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Timing overrides.
    #[serde(default)]
    pub timing: TimingConfig,
    /// Generated values.
    #[serde(default)]
    pub generate: GenerateConfig,
    /// Ordered stages.
    pub stages: Vec<StageConfig>,
}

impl SessionConfig {
    /// Load and validate a session file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or `AppError::Validation` if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a session definition.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing fails or `AppError::Validation`
    /// if validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed SSH destination.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `ssh_target` is malformed.
    pub fn ssh_target(&self) -> Result<Option<SshTarget>> {
        self.ssh_target.as_deref().map(SshTarget::parse).transpose()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Validation("session name must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(AppError::Validation("at least one stage is required".into()));
        }
        let target = self.ssh_target()?;

        let ports = unique_names("port", &self.generate.ports)?;
        check_port_count(ports.len())?;
        let tokens = unique_names("token", &self.generate.tokens)?;
        let known = Known {
            ports: &ports,
            tokens: &tokens,
            target: target.as_ref(),
        };

        let mut stage_names = HashSet::new();
        let mut captures: HashSet<&str> = HashSet::new();

        for stage in &self.stages {
            let name = stage.name.as_str();
            if name.trim().is_empty() {
                return Err(AppError::Validation("stage name must not be empty".into()));
            }
            if !stage_names.insert(name) {
                return Err(AppError::Validation(format!("duplicate stage name {name}")));
            }
            if stage.command.trim().is_empty() {
                return Err(AppError::Validation(format!("{name}: command must not be empty")));
            }
            for file in &stage.files {
                check_relative(name, &file.path)?;
            }
            validate_shape(stage)?;

            for template in stage.start_templates() {
                known.check(name, template, &captures)?;
            }

            if let Some(capture) = &stage.capture {
                let regex = Regex::new(&capture.regex)?;
                if regex.captures_len() != 2 {
                    return Err(AppError::Validation(format!(
                        "{name}: capture {} needs exactly one group",
                        capture.name
                    )));
                }
                if !captures.insert(capture.name.as_str()) {
                    return Err(AppError::Validation(format!(
                        "{name}: capture {} already defined",
                        capture.name
                    )));
                }
            }

            for template in stage.teardown_templates() {
                known.check(name, template, &captures)?;
            }
        }

        Ok(())
    }
}

fn validate_shape(stage: &StageConfig) -> Result<()> {
    let name = &stage.name;
    match stage.kind {
        StageKind::Task => {
            if stage.readiness.is_some() {
                return Err(AppError::Validation(format!(
                    "{name}: task stages are ready when they exit; drop [readiness]"
                )));
            }
        }
        StageKind::Service => {
            if stage.teardown.is_some() {
                return Err(AppError::Validation(format!(
                    "{name}: service stages are torn down by terminating them; drop [teardown]"
                )));
            }
        }
    }

    if let Some(readiness) = &stage.readiness {
        match (&readiness.pattern, &readiness.regex) {
            (Some(_), None) => {}
            (None, Some(regex)) => {
                Regex::new(regex)?;
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "{name}: readiness needs exactly one of pattern or regex"
                )));
            }
        }
        if readiness.max_attempts == 0 {
            return Err(AppError::Validation(format!(
                "{name}: readiness max_attempts must be greater than zero"
            )));
        }
    }
    Ok(())
}

fn unique_names<'a>(what: &str, names: &'a [String]) -> Result<HashSet<&'a str>> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(AppError::Validation(format!("{what} name must not be empty")));
        }
        if !seen.insert(name.as_str()) {
            return Err(AppError::Validation(format!("duplicate {what} name {name}")));
        }
    }
    Ok(seen)
}

/// Reject paths that could leave the session temp dir once joined to it.
pub(crate) fn check_relative(stage: &str, path: &str) -> Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.is_empty() || escapes {
        return Err(AppError::Validation(format!(
            "{stage}: file path {path:?} must stay inside the session temp dir"
        )));
    }
    Ok(())
}

struct Known<'a> {
    ports: &'a HashSet<&'a str>,
    tokens: &'a HashSet<&'a str>,
    target: Option<&'a SshTarget>,
}

impl Known<'_> {
    fn check(&self, stage: &str, template: &str, captures: &HashSet<&str>) -> Result<()> {
        for reference in references(template)? {
            let ok = match &reference {
                Reference::Port(name) => self.ports.contains(name.as_str()),
                Reference::Token(name) => self.tokens.contains(name.as_str()),
                Reference::Target | Reference::TargetHost => self.target.is_some(),
                Reference::TargetUser => self.target.and_then(SshTarget::user).is_some(),
                Reference::Capture(name) => captures.contains(name.as_str()),
                Reference::TempDir | Reference::Env(_) => true,
            };
            if !ok {
                return Err(AppError::Validation(format!(
                    "{stage}: {reference} is not defined at this point"
                )));
            }
        }
        Ok(())
    }
}
