use std::path::{Path, PathBuf};

pub fn get_root() -> PathBuf {
    dirs::home_dir()
        .expect("Home directory not found")
        .join(".coresmith")
}

pub fn get_cores_dir(root: &Path, family: &str) -> PathBuf {
    root.join("cores").join(family)
}

pub fn get_cache_dir(root: &Path) -> PathBuf {
    root.join("cache")
}

pub fn get_output_dir(root: &Path, family: &str) -> PathBuf {
    root.join("output").join(family)
}

pub fn get_core_dir(cores_dir: &Path, core: &str) -> PathBuf {
    cores_dir.join(core)
}

/// Cache entries are keyed by repository coordinate and revision so that
/// every CPU target downloading the same archive shares one file.
pub fn get_archive_cache_path(cache_dir: &Path, repo: &str, rev: &str) -> PathBuf {
    let entry_name = format!("{}-{}.tar.gz", repo.replace('/', "-"), rev);
    cache_dir.join(entry_name)
}

/// Marker recording which revision a fetched core directory holds.
pub fn get_revision_marker(core_dir: &Path) -> PathBuf {
    core_dir.join(".revision")
}

pub fn get_patches_dir(config_dir: &Path, core: &str) -> PathBuf {
    config_dir.join("patches").join(core)
}
