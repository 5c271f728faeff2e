//! Source acquisition: cache-first archive downloads with a git fallback,
//! safe to call repeatedly.

use crate::error::{Error, Result};
use crate::recipe::CoreRecipe;
use crate::store::{archives, paths};
use git2::build::{CheckoutBuilder, RepoBuilder};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use url::Url;

pub const DEFAULT_WORKERS: usize = 4;

/// Per-core result of [`SourceAcquirer::ensure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched,
    /// The source tree was already present; nothing was re-validated or
    /// re-fetched.
    Skipped,
}

/// Aggregate counts for one fetch phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchSummary {
    pub fetched: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Ensures core source trees exist on disk, fetched at the recipe's
/// revision, doing the minimum network and disk work necessary.
pub struct SourceAcquirer {
    cores_dir: PathBuf,
    cache_dir: PathBuf,
    workers: usize,
    cache_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl SourceAcquirer {
    pub fn new(cores_dir: PathBuf, cache_dir: PathBuf, workers: usize) -> SourceAcquirer {
        SourceAcquirer {
            cores_dir,
            cache_dir,
            workers: workers.max(1),
            cache_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Guarantees the core's source tree exists at its conventional path.
    ///
    /// An existing tree at the recorded revision (or with no record at all)
    /// is a no-op success; a tree recorded at a different revision is
    /// deleted and fetched again. Fetches land in a sibling `.partial`
    /// directory and are renamed into place only when complete, so an
    /// interrupted fetch never masquerades as a finished one.
    pub async fn ensure(&self, name: &str, recipe: &CoreRecipe) -> Result<FetchOutcome> {
        let dest = paths::get_core_dir(&self.cores_dir, name);

        let mut stale: Option<String> = None;
        if dest.exists() {
            let Some(rev) = recipe.rev.as_deref() else {
                return Ok(FetchOutcome::Skipped);
            };
            let recorded = fs::read_to_string(paths::get_revision_marker(&dest))
                .await
                .ok();
            match recorded {
                Some(recorded) if recorded.trim() != rev => {
                    stale = Some(recorded.trim().to_string());
                }
                _ => return Ok(FetchOutcome::Skipped),
            }
        }

        let repo = recipe.repo.as_deref().ok_or_else(|| {
            Error::Acquisition(format!("core '{}' recipe is missing 'repo'", name))
        })?;
        let rev = recipe.rev.as_deref().ok_or_else(|| {
            Error::Acquisition(format!("core '{}' recipe is missing 'rev'", name))
        })?;

        if let Some(old) = stale {
            warn!("revision changed for {} ({} -> {}), refetching", name, old, rev);
            fs::remove_dir_all(&dest).await?;
        }

        fs::create_dir_all(&self.cores_dir).await?;

        let partial = self.cores_dir.join(format!(".{}.partial", name));
        if partial.exists() {
            fs::remove_dir_all(&partial).await?;
        }

        if let Err(err) = self.fetch_into(&partial, repo, rev, recipe.submodules).await {
            if partial.exists() {
                let _ = fs::remove_dir_all(&partial).await;
            }
            return Err(err);
        }

        fs::write(paths::get_revision_marker(&partial), rev).await?;
        fs::rename(&partial, &dest).await?;

        Ok(FetchOutcome::Fetched)
    }

    /// Runs `ensure` for a whole recipe set across a bounded worker pool.
    ///
    /// Workers pull from a shared FIFO queue and report per-core outcomes
    /// over a channel; this loop alone owns the counters, so no shared
    /// mutable state exists beyond the queue itself. One core's failure
    /// never aborts the others.
    pub async fn ensure_all(
        self: &Arc<SourceAcquirer>,
        cores: &BTreeMap<String, CoreRecipe>,
    ) -> FetchSummary {
        let queue: VecDeque<(String, CoreRecipe)> = cores
            .iter()
            .map(|(name, recipe)| (name.clone(), recipe.clone()))
            .collect();
        let queue = Arc::new(Mutex::new(queue));
        let (tx, mut rx) = mpsc::channel(cores.len().max(1));

        let workers = self.workers.min(cores.len().max(1));
        for _ in 0..workers {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            let acquirer = Arc::clone(self);

            tokio::spawn(async move {
                loop {
                    let job = queue.lock().await.pop_front();
                    let Some((name, recipe)) = job else {
                        break;
                    };
                    let outcome = acquirer.ensure(&name, &recipe).await;
                    if tx.send((name, outcome)).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut summary = FetchSummary::default();
        while let Some((name, outcome)) = rx.recv().await {
            match outcome {
                Ok(FetchOutcome::Fetched) => {
                    info!("fetched source: {}", name);
                    summary.fetched += 1;
                }
                Ok(FetchOutcome::Skipped) => {
                    debug!("source already present: {}", name);
                    summary.skipped += 1;
                }
                Err(err) => {
                    error!("fetch failed for {}: {}", name, err);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    async fn fetch_into(
        &self,
        dest: &Path,
        repo: &str,
        rev: &str,
        submodules: bool,
    ) -> Result<()> {
        if is_hex_revision(rev) && !submodules {
            return self.fetch_archive(dest, repo, rev).await;
        }

        let url = clone_url(repo);
        if is_hex_revision(rev) {
            // A shallow clone cannot check out an arbitrary historical
            // hash; take the full history and detach.
            return clone_full(&url, rev, dest, submodules);
        }

        match clone_shallow(&url, rev, dest, submodules) {
            Ok(()) => Ok(()),
            Err(err) => {
                // libgit2 resolves only branch names during clone; tags
                // take the full-clone path.
                debug!("shallow clone failed ({}), retrying with full history", err);
                if dest.exists() {
                    fs::remove_dir_all(dest).await?;
                }
                clone_full(&url, rev, dest, submodules)
            }
        }
    }

    async fn fetch_archive(&self, dest: &Path, repo: &str, rev: &str) -> Result<()> {
        let cache_path = paths::get_archive_cache_path(&self.cache_dir, repo, rev);

        let lock = self.cache_lock(&cache_path).await;
        let guard = lock.lock().await;
        if cache_path.exists() {
            debug!("archive cache hit: {}", cache_path.display());
        } else {
            self.download_archive(repo, rev, &cache_path).await?;
        }
        drop(guard);

        archives::unpack_github_archive(dest, &cache_path, &dest.with_extension("unpack")).await
    }

    async fn download_archive(&self, repo: &str, rev: &str, cache_path: &Path) -> Result<()> {
        let url = Url::parse(&format!(
            "https://github.com/{}/archive/{}.tar.gz",
            repo, rev
        ))
        .map_err(|err| {
            Error::Acquisition(format!("invalid repository coordinate '{}': {}", repo, err))
        })?;

        info!("downloading archive: {}", url);

        let response = reqwest::get(url.as_str()).await.map_err(|err| {
            Error::Acquisition(format!("download of {} failed: {}", url, err))
        })?;

        if !response.status().is_success() {
            return Err(Error::Acquisition(format!(
                "download of {} failed: {}",
                url,
                response.status()
            )));
        }

        let bytes = response.bytes().await.map_err(|err| {
            Error::Acquisition(format!("download of {} interrupted: {}", url, err))
        })?;

        fs::create_dir_all(&self.cache_dir).await?;

        // Written next to the final path so the rename stays on one
        // filesystem and readers only ever see complete archives.
        let temp_path = cache_path.with_extension("part");
        fs::write(&temp_path, &bytes).await?;
        fs::rename(&temp_path, cache_path).await?;

        Ok(())
    }

    /// One lock per cache entry: concurrent workers wanting the same
    /// archive serialize, workers wanting different archives do not.
    async fn cache_lock(&self, cache_path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.cache_locks.lock().await;
        locks
            .entry(cache_path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// A revision that is plausibly a content hash rather than a tag or branch
/// name.
fn is_hex_revision(rev: &str) -> bool {
    rev.len() >= 7 && rev.chars().all(|c| c.is_ascii_hexdigit())
}

fn clone_url(repo: &str) -> String {
    format!("https://github.com/{}", repo)
}

fn clone_shallow(url: &str, rev: &str, dest: &Path, submodules: bool) -> Result<()> {
    info!("cloning {} at '{}' (shallow)", url, rev);

    let mut fetch_options = git2::FetchOptions::new();
    fetch_options.depth(1);

    let mut builder = RepoBuilder::new();
    builder.fetch_options(fetch_options);
    builder.branch(rev);

    let repo = builder.clone(url, dest).map_err(|err| {
        Error::Acquisition(format!("shallow clone of {} at '{}' failed: {}", url, rev, err))
    })?;

    if submodules {
        update_submodules(&repo)?;
    }

    Ok(())
}

fn clone_full(url: &str, rev: &str, dest: &Path, submodules: bool) -> Result<()> {
    info!("cloning {} at {} (full)", url, rev);

    let mut builder = RepoBuilder::new();
    let repo = builder.clone(url, dest).map_err(|err| {
        Error::Acquisition(format!("clone of {} failed: {}", url, err))
    })?;

    // revparse may yield an annotated tag; peel down to its commit
    let commit = repo
        .revparse_single(rev)
        .and_then(|object| object.peel_to_commit())
        .map_err(|err| {
            Error::Acquisition(format!("revision '{}' not found in {}: {}", rev, url, err))
        })?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_tree(commit.as_object(), Some(&mut checkout))
        .map_err(|err| {
            Error::Acquisition(format!("checkout of '{}' failed: {}", rev, err))
        })?;
    repo.set_head_detached(commit.id()).map_err(|err| {
        Error::Acquisition(format!("checkout of '{}' failed: {}", rev, err))
    })?;

    if submodules {
        update_submodules(&repo)?;
    }

    Ok(())
}

fn update_submodules(repo: &git2::Repository) -> Result<()> {
    let submodules = repo.submodules().map_err(|err| {
        Error::Acquisition(format!("cannot enumerate submodules: {}", err))
    })?;

    for mut submodule in submodules {
        submodule.update(true, None).map_err(|err| {
            Error::Acquisition(format!(
                "submodule '{}' update failed: {}",
                submodule.name().unwrap_or("?"),
                err
            ))
        })?;
    }

    Ok(())
}
