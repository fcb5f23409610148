//! Converge engine adapter that shells out to an external command.

use std::ffi::OsString;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    ConvergeAction, ConvergeContext, ConvergeEngine, ConvergeFailure, DeclaredResource,
    EngineFuture,
};
use crate::command::{CommandError, CommandRunner, RunOptions};
use crate::recipe::RecipeSet;

/// Settings for [`CommandConvergeEngine`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EngineSettings {
    /// Engine executable.
    pub engine_bin: String,
    /// Directory the recipe file is written to and the engine runs in.
    pub work_dir: Utf8PathBuf,
    /// Upper bound on one apply.
    pub timeout: Duration,
}

/// Runs `{engine_bin} {recipe} --action TAG [--server-url URL]` and reads
/// one JSON resource per stdout line.
#[derive(Clone, Debug)]
pub struct CommandConvergeEngine<R> {
    runner: R,
    settings: EngineSettings,
}

impl<R: CommandRunner> CommandConvergeEngine<R> {
    /// Creates an engine adapter.
    #[must_use]
    pub const fn new(runner: R, settings: EngineSettings) -> Self {
        Self { runner, settings }
    }

    /// Settings in use.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn write_recipe(&self, file_name: &str, recipes: &RecipeSet) -> Result<Utf8PathBuf, String> {
        let work_dir = &self.settings.work_dir;
        Dir::create_ambient_dir_all(work_dir, ambient_authority())
            .map_err(|err| format!("failed to create {work_dir}: {err}"))?;
        let dir = Dir::open_ambient_dir(work_dir, ambient_authority())
            .map_err(|err| format!("failed to open {work_dir}: {err}"))?;
        let path = work_dir.join(file_name);
        dir.write(file_name, recipes.render())
            .map_err(|err| format!("failed to write {path}: {err}"))?;
        Ok(path)
    }

    fn remove_recipe(&self, file_name: &str) {
        if let Ok(dir) = Dir::open_ambient_dir(&self.settings.work_dir, ambient_authority()) {
            dir.remove_file(file_name).ok();
        }
    }

    fn engine_args(
        recipe_path: &Utf8Path,
        action: ConvergeAction,
        context: &ConvergeContext,
    ) -> Vec<OsString> {
        let mut args = vec![
            OsString::from(recipe_path.as_str()),
            OsString::from("--action"),
            OsString::from(action.tag()),
        ];
        if let Some(url) = &context.server_url {
            args.push(OsString::from("--server-url"));
            args.push(OsString::from(url));
        }
        args
    }
}

impl<R> ConvergeEngine for CommandConvergeEngine<R>
where
    R: CommandRunner + Send + Sync,
{
    fn apply<'a>(
        &'a self,
        recipes: &'a RecipeSet,
        action: ConvergeAction,
        context: &'a ConvergeContext,
    ) -> EngineFuture<'a> {
        Box::pin(async move {
            if context.cancel.is_cancelled() {
                return Err(ConvergeFailure::cancelled(
                    format!("{action} apply cancelled before it started"),
                    Vec::new(),
                ));
            }

            let file_name = format!("{}-{}.rb", action.tag(), Uuid::new_v4());
            let recipe_path = self
                .write_recipe(&file_name, recipes)
                .map_err(|message| ConvergeFailure::new(message, Vec::new()))?;
            let args = Self::engine_args(&recipe_path, action, context);
            let options = RunOptions::new(self.settings.timeout)
                .in_dir(self.settings.work_dir.clone())
                .cancelled_by(context.cancel.clone());

            info!(engine = %self.settings.engine_bin, recipe = %recipe_path, %action, "applying recipe set");
            let result = self
                .runner
                .run(&self.settings.engine_bin, &args, &options)
                .await;
            self.remove_recipe(&file_name);

            match result {
                Ok(output) => {
                    let declared = parse_resources(&output.stdout);
                    debug!(%action, resources = declared.len(), "engine finished");
                    if output.is_success() {
                        Ok(declared)
                    } else {
                        Err(ConvergeFailure::new(
                            format!(
                                "{} failed applying {recipe_path} for {action} with status {}: {}",
                                self.settings.engine_bin,
                                output.status_text(),
                                output.stderr.trim()
                            ),
                            declared,
                        ))
                    }
                }
                Err(err) => {
                    let declared = err
                        .partial_output()
                        .map(|output| parse_resources(&output.stdout))
                        .unwrap_or_default();
                    let message = format!("applying {recipe_path} for {action}: {err}");
                    if matches!(err, CommandError::Cancelled { .. }) {
                        Err(ConvergeFailure::cancelled(message, declared))
                    } else {
                        Err(ConvergeFailure::new(message, declared))
                    }
                }
            }
        })
    }
}

/// Parses newline-delimited JSON resources, skipping lines that are not
/// resource objects.
#[must_use]
pub fn parse_resources(stdout: &str) -> Vec<DeclaredResource> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .filter_map(|line| serde_json::from_str::<DeclaredResource>(line).ok())
        .collect()
}
