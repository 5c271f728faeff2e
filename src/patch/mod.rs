//! Idempotent application of per-core patch sets.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Patch files for one core, lexicographically sorted. A missing directory
/// simply yields no patches.
pub fn collect_patches(patches_dir: &Path) -> Vec<PathBuf> {
    if !patches_dir.is_dir() {
        return Vec::new();
    }

    WalkDir::new(patches_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .path()
                .extension()
                .is_some_and(|ext| ext == "patch" || ext == "diff")
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Applies every patch under `patches_dir` to `source_dir`, exactly once.
///
/// The source tree may already carry these patches: fetch skips existing
/// directories, so a re-run sees the result of the previous run. Each patch
/// is therefore dry-run checked forward first, and probed in reverse when
/// that fails; a tree that already contains the patch's result is skipped
/// without error. Blind re-application is never attempted.
pub async fn apply_all(source_dir: &Path, patches_dir: &Path) -> Result<()> {
    for patch in collect_patches(patches_dir) {
        let patch = patch.canonicalize().unwrap_or(patch);
        apply_one(source_dir, &patch).await?;
    }

    Ok(())
}

async fn apply_one(source_dir: &Path, patch: &Path) -> Result<()> {
    if run_patch_tool(source_dir, patch, &["--dry-run"]).await? {
        if !run_patch_tool(source_dir, patch, &[]).await? {
            return Err(Error::Patch {
                patch: patch.to_path_buf(),
                detail: "passed the dry run but failed to apply".to_string(),
            });
        }
        info!("applied patch: {}", patch.display());
        return Ok(());
    }

    if run_patch_tool(source_dir, patch, &["--reverse", "--dry-run"]).await? {
        debug!("patch already applied: {}", patch.display());
        return Ok(());
    }

    Err(Error::Patch {
        patch: patch.to_path_buf(),
        detail: "neither applies cleanly nor is already applied".to_string(),
    })
}

async fn run_patch_tool(source_dir: &Path, patch: &Path, extra: &[&str]) -> Result<bool> {
    let status = Command::new("patch")
        .args(["-p1", "-s", "-f"])
        .args(extra)
        .arg("-i")
        .arg(patch)
        .current_dir(source_dir)
        .status()
        .await
        .map_err(|err| Error::Patch {
            patch: patch.to_path_buf(),
            detail: format!("cannot run the patch tool: {}", err),
        })?;

    Ok(status.success())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn patch_tool_available() -> bool {
        std::process::Command::new("patch")
            .arg("--version")
            .output()
            .is_ok()
    }

    const PATCH: &str = "\
--- a/config.h
+++ b/config.h
@@ -1,2 +1,2 @@
-#define RENDERER gl
+#define RENDERER gles
 #define THREADS 1
";

    fn write_tree(dir: &Path) -> (PathBuf, PathBuf) {
        let source = dir.join("core");
        fs::create_dir_all(&source).unwrap();
        fs::write(
            source.join("config.h"),
            "#define RENDERER gl\n#define THREADS 1\n",
        )
        .unwrap();

        let patches = dir.join("patches").join("core");
        fs::create_dir_all(&patches).unwrap();
        fs::write(patches.join("0001-gles.patch"), PATCH).unwrap();

        (source, patches)
    }

    #[test]
    fn collects_sorted_patch_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let patches = dir.path().join("patches");
        fs::create_dir_all(&patches).unwrap();
        fs::write(patches.join("0002-later.patch"), "").unwrap();
        fs::write(patches.join("0001-first.patch"), "").unwrap();
        fs::write(patches.join("0001a-between.diff"), "").unwrap();
        fs::write(patches.join("notes.txt"), "").unwrap();

        let found = collect_patches(&patches);
        let names: Vec<&str> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["0001-first.patch", "0001a-between.diff", "0002-later.patch"]
        );
    }

    #[test]
    fn missing_patch_dir_yields_nothing() {
        assert!(collect_patches(Path::new("/does/not/exist")).is_empty());
    }

    // Applying the same set twice leaves the tree in the same final state.
    #[tokio::test]
    async fn apply_twice_is_idempotent() {
        if !patch_tool_available() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let (source, patches) = write_tree(dir.path());

        apply_all(&source, &patches).await.unwrap();
        let after_first = fs::read_to_string(source.join("config.h")).unwrap();
        assert!(after_first.contains("RENDERER gles"));

        apply_all(&source, &patches).await.unwrap();
        let after_second = fs::read_to_string(source.join("config.h")).unwrap();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn conflicting_patch_names_the_offender() {
        if !patch_tool_available() {
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let (source, patches) = write_tree(dir.path());
        fs::write(
            source.join("config.h"),
            "#define RENDERER vulkan\n#define THREADS 4\n",
        )
        .unwrap();

        let err = apply_all(&source, &patches).await.unwrap_err();
        match err {
            Error::Patch { patch, .. } => {
                assert!(patch.to_string_lossy().contains("0001-gles.patch"));
            }
            other => panic!("expected a patch error, got {:?}", other),
        }
    }
}
