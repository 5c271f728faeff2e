//! Error taxonomy for the build-orchestration engine.

use std::path::PathBuf;

/// Errors produced while loading configuration, acquiring sources, composing
/// commands, patching, and building cores.
///
/// Every per-core operation is wrapped so that a value of this type affects
/// only that core's outcome; the only variants that abort a whole run are
/// `Configuration` raised during profile or recipe-set loading and `Io`
/// raised while preparing the output directory.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or incomplete CPU profile or recipe.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Network or extraction failure while acquiring a core's source tree,
    /// or a recipe missing its repository coordinates.
    #[error("acquisition error: {0}")]
    Acquisition(String),

    /// A patch neither applies cleanly nor is already applied.
    #[error("patch {} failed: {detail}", patch.display())]
    Patch {
        /// The offending patch file.
        patch: PathBuf,
        /// What the dry-run checks reported.
        detail: String,
    },

    /// The composer was invoked with an inconsistent recipe (unknown build
    /// kind or a missing kind-specific field). A config defect, never
    /// retried or defaulted.
    #[error("composition error: {0}")]
    Composition(String),

    /// The external build tool exited non-zero.
    #[error("{program} exited with status {status}\n{stderr_tail}")]
    BuildProcess {
        /// The tool that was invoked (`make`, `cmake`, ...).
        program: String,
        /// Exit code, or "signal" when killed.
        status: String,
        /// The last portion of the tool's stderr, bounded.
        stderr_tail: String,
    },

    /// The build tool exited zero but the declared artifact path does not
    /// exist. A recipe/metadata defect, not a compiler failure.
    #[error("artifact not found after build: {}", path.display())]
    ArtifactMissing {
        /// Where the recipe said the artifact would appear.
        path: PathBuf,
    },

    /// A build subprocess exceeded the configured wall-clock timeout.
    #[error("{program} timed out after {secs}s")]
    Timeout {
        /// The tool that was killed.
        program: String,
        /// The configured limit.
        secs: u64,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
