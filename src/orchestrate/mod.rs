//! Top-level sequencing for one CPU target: load, fetch, build, report.

use crate::build::{BuildExecutor, BuildReport};
use crate::compose::overrides::Overrides;
use crate::profile::CpuTargetProfile;
use crate::recipe::{self, RecipeSet};
use crate::source::{FetchSummary, SourceAcquirer};
use crate::store::paths;
use anyhow::{bail, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything one run needs, wired up by the CLI.
pub struct RunOptions {
    pub family: String,
    /// Root for cores, cache, and output; defaults to `~/.coresmith`.
    pub root: Option<PathBuf>,
    /// Directory holding `profiles.toml`, `recipes.toml`, and `patches/`.
    pub config_dir: PathBuf,
    /// Explicit core selection; empty means the whole recipe set.
    pub cores: Vec<String>,
    pub jobs: usize,
    pub fetch_workers: usize,
    pub clean: bool,
    pub timeout_secs: Option<u64>,
    pub fetch: bool,
    pub build: bool,
}

/// Runs the fetch and build phases for one CPU target. Per-core failures
/// surface only in the counts; the returned error reflects run-level
/// failures and the "nothing succeeded" exit policy.
pub async fn run(options: RunOptions) -> Result<()> {
    let root = options.root.clone().unwrap_or_else(paths::get_root);

    let profile =
        CpuTargetProfile::load(&options.family, &options.config_dir.join("profiles.toml"))?;
    let set = recipe::load_recipes(&options.config_dir.join("recipes.toml"))?;

    if set.is_empty() {
        bail!("no recipes found for target {}", profile.family);
    }

    for core in &options.cores {
        if !set.cores.contains_key(core) && !set.malformed.contains_key(core) {
            bail!("unknown core '{}' requested", core);
        }
    }

    info!(
        "target {}: {} recipes ({} malformed)",
        profile.family,
        set.cores.len(),
        set.malformed.len()
    );

    let cores_dir = paths::get_cores_dir(&root, &profile.family);
    let cache_dir = paths::get_cache_dir(&root);
    let output_dir = paths::get_output_dir(&root, &profile.family);

    let mut fetch_summary = FetchSummary::default();
    if options.fetch {
        let acquirer = Arc::new(SourceAcquirer::new(
            cores_dir.clone(),
            cache_dir,
            options.fetch_workers,
        ));
        let wanted = selected_cores(&set, &options.cores);
        fetch_summary = acquirer.ensure_all(&wanted).await;
        info!(
            "fetch complete: {} fetched, {} skipped, {} failed",
            fetch_summary.fetched, fetch_summary.skipped, fetch_summary.failed
        );
    }

    if !options.build {
        if fetch_summary.fetched + fetch_summary.skipped == 0 {
            bail!("no sources fetched for {}", profile.family);
        }
        return Ok(());
    }

    tokio::fs::create_dir_all(&output_dir).await?;

    let overrides = Overrides::builtin();
    let executor = BuildExecutor {
        profile: &profile,
        overrides: &overrides,
        cores_dir,
        output_dir,
        patches_root: options.config_dir.join("patches"),
        jobs: options.jobs,
        clean: options.clean,
        timeout: options.timeout_secs.map(Duration::from_secs),
        selected: if options.cores.is_empty() {
            None
        } else {
            Some(options.cores.clone())
        },
    };

    let report = executor.build_all(&set).await;
    report_summary(&profile.family, &report);

    if report.built() == 0 {
        bail!("no cores built for {}", profile.family);
    }

    Ok(())
}

fn selected_cores(
    set: &RecipeSet,
    selection: &[String],
) -> BTreeMap<String, recipe::CoreRecipe> {
    set.cores
        .iter()
        .filter(|(name, _)| selection.is_empty() || selection.contains(name))
        .map(|(name, recipe)| (name.clone(), recipe.clone()))
        .collect()
}

fn report_summary(family: &str, report: &BuildReport) {
    info!(
        "build complete for {}: {} built, {} failed, {} skipped",
        family,
        report.built(),
        report.failed(),
        report.skipped()
    );
}
