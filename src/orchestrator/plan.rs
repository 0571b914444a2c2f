//! Turns a validated [`SessionConfig`] into runnable stages.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::{info, warn};

use crate::config::{check_relative, SessionConfig, StageConfig, TeardownConfig};
use crate::models::stage::StageKind;
use crate::orchestrator::context::SessionContext;
use crate::orchestrator::readiness::{Pattern, ReadinessProbe, ReadyMatcher, Substring};
use crate::orchestrator::session_manager::SessionOrchestrator;
use crate::orchestrator::stage::{Launched, Stage, StageLaunch, TeardownContext};
use crate::process::{ProcessHandle, SpawnRequest};
use crate::template::Vars;
use crate::{AppError, Result};

/// Build the orchestrator for `config`.
///
/// Creates the session temp dir and registers its removal as the first
/// cleanup entry, so it is the last thing torn down.
///
/// # Errors
///
/// Returns `AppError::Io` if the temp dir cannot be created, or
/// `AppError::Validation` if a regex in the session file does not compile.
pub fn prepare(ctx: &SessionContext, config: &SessionConfig) -> Result<SessionOrchestrator> {
    let temp = tempfile::Builder::new()
        .prefix(&format!("{}-", config.name))
        .tempdir()
        .map_err(|err| AppError::Io(format!("failed to create session temp dir: {err}")))?;
    let temp_path = temp.path().to_path_buf();
    info!(path = %temp_path.display(), "session temp dir created");

    ctx.cleanup().push("remove session temp dir", move || async move {
        let path = temp.path().display().to_string();
        temp.close()
            .map_err(|err| AppError::Io(format!("failed to remove {path}: {err}")))?;
        info!(path, "session temp dir removed");
        Ok::<_, AppError>(())
    });

    let vars = Vars::generate(&config.generate.ports, &config.generate.tokens)?
        .with_target(config.ssh_target()?)
        .with_temp_dir(&temp_path);

    let stages = config
        .stages
        .iter()
        .map(|stage| build_stage(stage, &vars, &temp_path))
        .collect::<Result<Vec<_>>>()?;

    Ok(SessionOrchestrator::new(ctx.clone(), config.name.clone(), stages))
}

fn build_stage(config: &StageConfig, vars: &Vars, temp_dir: &Path) -> Result<Stage> {
    let start = {
        let config = config.clone();
        let vars = vars.clone();
        let temp_dir = temp_dir.to_path_buf();
        move |launch: StageLaunch| async move {
            launch_stage(&launch, &config, &vars, &temp_dir).await
        }
    };

    let mut stage = match config.kind {
        StageKind::Service => Stage::service(config.name.clone(), start),
        StageKind::Task => Stage::task(config.name.clone(), start),
    };

    if let Some(readiness) = &config.readiness {
        let matcher: Arc<dyn ReadyMatcher> = match (&readiness.pattern, &readiness.regex) {
            (_, Some(regex)) => Arc::new(Pattern(Regex::new(regex)?)),
            (Some(pattern), None) => Arc::new(Substring(pattern.clone())),
            (None, None) => {
                return Err(AppError::Validation(format!(
                    "{}: readiness needs a pattern or regex",
                    config.name
                )));
            }
        };
        stage = stage.ready_when(
            matcher,
            ReadinessProbe {
                interval: readiness.interval(),
                max_attempts: readiness.max_attempts,
            },
        );
    }

    if let Some(capture) = &config.capture {
        let regex = Regex::new(&capture.regex)?;
        let name = capture.name.clone();
        let stage_name = config.name.clone();
        let vars = vars.clone();
        stage = stage.on_ready(move |handle: &ProcessHandle| {
            let text = handle.output().text();
            let value = regex
                .captures(&text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_owned())
                .ok_or_else(|| {
                    AppError::Validation(format!(
                        "{stage_name}: capture {name} not found in output"
                    ))
                })?;
            info!(stage = stage_name, capture = name, value, "captured");
            vars.set_capture(name, value);
            Ok(())
        });
    }

    if let Some(teardown) = &config.teardown {
        let teardown = teardown.clone();
        let vars = vars.clone();
        stage = stage.teardown(move |tc| run_teardown_command(tc, teardown, vars));
    }

    Ok(stage)
}

async fn launch_stage(
    launch: &StageLaunch,
    config: &StageConfig,
    vars: &Vars,
    temp_dir: &Path,
) -> Result<Launched> {
    for file in &config.files {
        // Rendered values may introduce `..` or a root the raw template hid.
        let relative = vars.render(&file.path)?;
        check_relative(&config.name, &relative)?;
        let path = temp_dir.join(relative);
        write_file(&path, &vars.render(&file.contents)?).await?;
        info!(stage = launch.stage(), path = %path.display(), "config file written");
    }

    let env = config
        .env
        .iter()
        .map(|(key, value)| Ok((key.clone(), vars.render(value)?)))
        .collect::<Result<Vec<_>>>()?;
    let request = SpawnRequest::new(config.name.clone(), vars.render(&config.command)?)
        .args(vars.render_all(&config.args)?)
        .envs(env);

    let handle = launch.spawn(request)?;
    match config.kind {
        // A task may finish and leave the registry before the lookup runs.
        StageKind::Task => Ok(Launched::Handle(handle)),
        StageKind::Service => Ok(Launched::Correlated),
    }
}

async fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents)
        .await
        .map_err(|err| AppError::Io(format!("failed to write {}: {err}", path.display())))
}

async fn run_teardown_command(
    tc: TeardownContext,
    teardown: TeardownConfig,
    vars: Vars,
) -> Result<()> {
    let request = SpawnRequest::new(
        format!("{} teardown", tc.stage),
        vars.render(&teardown.command)?,
    )
    .args(vars.render_all(&teardown.args)?);

    let handle = tc.ctx.factory().spawn(request)?;
    let exit = handle.wait().await;
    if exit.success() {
        Ok(())
    } else {
        warn!(stage = tc.stage, status = %exit, "teardown command failed");
        Err(AppError::CleanupActionFailed(format!(
            "{} teardown exited with {exit}",
            tc.stage
        )))
    }
}
