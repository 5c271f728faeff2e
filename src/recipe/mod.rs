//! Core recipes: the declarative per-core build descriptions.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// One core's build description as declared in `recipes.toml`.
///
/// Fields are kept loose on purpose: which ones are required depends on the
/// build kind, and that validation belongs to the composer so a malformed
/// recipe costs only its own core.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CoreRecipe {
    /// Repository coordinate, `organization/name`.
    pub repo: Option<String>,
    /// Commit hash or tag to build.
    pub rev: Option<String>,
    #[serde(default)]
    pub submodules: bool,
    /// Build-system kind: `make` or `cmake`.
    pub build: Option<String>,
    /// Subdirectory the make invocation runs in, relative to the source
    /// tree; `.` for the repository root.
    pub workdir: Option<String>,
    pub makefile: Option<String>,
    /// Explicit platform token; absent or unexpanded values fall back to the
    /// profile default.
    pub platform: Option<String>,
    /// Extra build-tool variable assignments, in declared order.
    #[serde(default)]
    pub args: Vec<String>,
    /// CMake configuration options; one entry may pack several tokens.
    #[serde(default)]
    pub options: Vec<String>,
    /// Where the built artifact appears, relative to the source tree.
    pub artifact: Option<String>,
    /// Output filename override; defaults to the artifact's own name.
    pub output: Option<String>,
}

/// The per-target recipe set: an ordered-by-name mapping, plus the entries
/// that failed to deserialize, isolated per core.
#[derive(Debug, Default)]
pub struct RecipeSet {
    pub cores: BTreeMap<String, CoreRecipe>,
    pub malformed: BTreeMap<String, String>,
}

impl RecipeSet {
    pub fn is_empty(&self) -> bool {
        self.cores.is_empty() && self.malformed.is_empty()
    }
}

/// Loads `recipes.toml`. A file that does not parse at all is a hard error;
/// a single `[cores.<name>]` entry of the wrong shape lands in `malformed`
/// and the rest of the set loads normally.
pub fn load_recipes(recipes_path: &Path) -> Result<RecipeSet> {
    let contents = std::fs::read_to_string(recipes_path).map_err(|err| {
        Error::Configuration(format!(
            "cannot read recipes file {}: {}",
            recipes_path.display(),
            err
        ))
    })?;

    let table: toml::Table = toml::from_str(&contents).map_err(|err| {
        Error::Configuration(format!(
            "invalid recipes file {}: {}",
            recipes_path.display(),
            err
        ))
    })?;

    let cores = table
        .get("cores")
        .and_then(|value| value.as_table())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "recipes file {} has no [cores.<name>] tables",
                recipes_path.display()
            ))
        })?;

    let mut set = RecipeSet::default();

    for (name, value) in cores {
        match value.clone().try_into::<CoreRecipe>() {
            Ok(recipe) => {
                set.cores.insert(name.clone(), recipe);
            }
            Err(err) => {
                set.malformed.insert(name.clone(), err.to_string());
            }
        }
    }

    Ok(set)
}
