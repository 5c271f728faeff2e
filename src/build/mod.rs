//! Sequential per-core build execution.
//!
//! Builds run one core at a time on purpose: concurrent third-party builds
//! interfere with each other through shared global build state, ccache
//! races, and memory pressure.

use crate::compose::{self, overrides::Overrides, BuildKind, ComposedCommand};
use crate::error::{Error, Result};
use crate::patch;
use crate::profile::CpuTargetProfile;
use crate::recipe::{CoreRecipe, RecipeSet};
use crate::store::paths;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time;
use tokio_stream::{wrappers::LinesStream, StreamExt};
use tracing::{error, info, warn};

const STDERR_TAIL_LINES: usize = 50;

/// Final state of one core's build attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildOutcome {
    Built(PathBuf),
    Failed(String),
    Skipped,
}

/// Per-core outcomes for one target's build phase.
#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: BTreeMap<String, BuildOutcome>,
}

impl BuildReport {
    pub fn built(&self) -> usize {
        self.count(|o| matches!(o, BuildOutcome::Built(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, BuildOutcome::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, BuildOutcome::Skipped))
    }

    fn count(&self, matcher: impl Fn(&BuildOutcome) -> bool) -> usize {
        self.outcomes.values().filter(|o| matcher(o)).count()
    }
}

/// Drives cores through patch, invoke, locate-artifact, and copy, isolating
/// each core's failure from all others.
pub struct BuildExecutor<'a> {
    pub profile: &'a CpuTargetProfile,
    pub overrides: &'a Overrides,
    pub cores_dir: PathBuf,
    pub output_dir: PathBuf,
    /// Parent of the per-core patch directories.
    pub patches_root: PathBuf,
    pub jobs: usize,
    /// Run the clean target before each make build.
    pub clean: bool,
    /// Wall-clock limit per build subprocess; `None` means unbounded.
    pub timeout: Option<Duration>,
    /// Explicit core selection; `None` builds the whole set.
    pub selected: Option<Vec<String>>,
}

impl BuildExecutor<'_> {
    /// Builds every core in the set sequentially, in name order. Per-core
    /// errors are caught here and recorded; nothing propagates.
    pub async fn build_all(&self, set: &RecipeSet) -> BuildReport {
        let mut report = BuildReport::default();

        for (name, reason) in &set.malformed {
            error!("{}: malformed recipe: {}", name, reason);
            report
                .outcomes
                .insert(name.clone(), BuildOutcome::Failed(reason.clone()));
        }

        for (name, recipe) in &set.cores {
            if let Some(selected) = &self.selected {
                if !selected.contains(name) {
                    report.outcomes.insert(name.clone(), BuildOutcome::Skipped);
                    continue;
                }
            }

            info!("building core: {}", name);

            let outcome = match self.build_one(name, recipe).await {
                Ok(artifact) => {
                    info!("built {}: {}", name, artifact.display());
                    BuildOutcome::Built(artifact)
                }
                Err(err) => {
                    error!("build failed for {}: {}", name, err);
                    BuildOutcome::Failed(err.to_string())
                }
            };
            report.outcomes.insert(name.clone(), outcome);
        }

        report
    }

    /// Builds one core and returns the copied artifact's destination path.
    pub async fn build_one(&self, name: &str, recipe: &CoreRecipe) -> Result<PathBuf> {
        let core_dir = paths::get_core_dir(&self.cores_dir, name);
        if !core_dir.is_dir() {
            return Err(Error::Acquisition(format!(
                "core '{}' has not been fetched: {} is missing",
                name,
                core_dir.display()
            )));
        }

        patch::apply_all(&core_dir, &self.patches_root.join(name)).await?;

        match compose::build_kind(name, recipe)? {
            BuildKind::Make => self.run_make_flow(name, recipe, &core_dir).await?,
            BuildKind::Cmake => self.run_cmake_flow(name, recipe, &core_dir).await?,
        }

        // A zero exit is not enough: misdeclared recipes leave the tool
        // happy and the artifact absent.
        let artifact_rel = recipe.artifact.as_deref().ok_or_else(|| {
            Error::Composition(format!("core '{}' recipe is missing 'artifact'", name))
        })?;
        let artifact = core_dir.join(artifact_rel);
        if !artifact.is_file() {
            return Err(Error::ArtifactMissing { path: artifact });
        }

        let output_name = match &recipe.output {
            Some(output) => output.clone(),
            None => artifact
                .file_name()
                .ok_or_else(|| {
                    Error::Composition(format!(
                        "core '{}' declares an artifact with no file name",
                        name
                    ))
                })?
                .to_string_lossy()
                .into_owned(),
        };

        fs::create_dir_all(&self.output_dir).await?;
        let dest = self.output_dir.join(output_name);
        fs::copy(&artifact, &dest).await?;

        Ok(dest)
    }

    async fn run_make_flow(
        &self,
        name: &str,
        recipe: &CoreRecipe,
        core_dir: &std::path::Path,
    ) -> Result<()> {
        if self.clean {
            let clean_command = compose::make_clean_command(
                self.profile,
                name,
                recipe,
                self.overrides,
                core_dir,
            )?;
            if let Err(err) = self.run_command(name, &clean_command).await {
                warn!("clean failed for {}: {}", name, err);
            }
        }

        let command = compose::make_command(
            self.profile,
            name,
            recipe,
            self.overrides,
            core_dir,
            self.jobs,
        )?;
        self.run_command(name, &command).await
    }

    async fn run_cmake_flow(
        &self,
        name: &str,
        recipe: &CoreRecipe,
        core_dir: &std::path::Path,
    ) -> Result<()> {
        let build_dir = core_dir.join("build");
        if build_dir.exists() {
            fs::remove_dir_all(&build_dir).await?;
        }
        fs::create_dir_all(&build_dir).await?;

        let prefix_path = std::env::var("CMAKE_PREFIX_PATH").ok();
        let configure = compose::cmake_configure_command(
            self.profile,
            recipe,
            core_dir,
            prefix_path.as_deref(),
        );
        self.run_command(name, &configure).await?;

        let build = compose::cmake_build_command(self.profile, core_dir, self.jobs);
        self.run_command(name, &build).await
    }

    async fn run_command(&self, core: &str, command: &ComposedCommand) -> Result<()> {
        info!("{}: {} {}", core, command.program, command.args.join(" "));

        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&command.current_dir)
            .envs(
                command
                    .env
                    .iter()
                    .map(|(key, value)| (key.as_str(), value.as_str())),
            )
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::BuildProcess {
                program: command.program.clone(),
                status: "failed to spawn".to_string(),
                stderr_tail: err.to_string(),
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("failed to capture stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Io(io::Error::other("failed to capture stderr")))?;

        let stdout_lines =
            LinesStream::new(BufReader::new(stdout).lines()).map(|line| (false, line));
        let stderr_lines =
            LinesStream::new(BufReader::new(stderr).lines()).map(|line| (true, line));
        let mut merged = StreamExt::merge(stdout_lines, stderr_lines);

        let mut tail: VecDeque<String> = VecDeque::new();

        let mut wait = Box::pin(async {
            while let Some((is_stderr, line)) = merged.next().await {
                let line = line?;
                info!("{}: {}", core, line);
                if is_stderr {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            child.wait().await
        });

        let status = match self.timeout {
            Some(limit) => match time::timeout(limit, &mut wait).await {
                Ok(status) => {
                    drop(wait);
                    status?
                }
                Err(_) => {
                    drop(wait);
                    child.kill().await.ok();
                    return Err(Error::Timeout {
                        program: command.program.clone(),
                        secs: limit.as_secs(),
                    });
                }
            },
            None => {
                let status = (&mut wait).await;
                drop(wait);
                status?
            }
        };

        if !status.success() {
            return Err(Error::BuildProcess {
                program: command.program.clone(),
                status: status
                    .code()
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr_tail: tail.into_iter().collect::<Vec<String>>().join("\n"),
            });
        }

        Ok(())
    }
}
