//! Per-core composition overrides, injected into the composer as a table so
//! the general composition rules stay free of core-specific branching.

use crate::profile::{Arch, CpuTargetProfile};
use std::collections::HashMap;

/// Replaces platform resolution and appends fixed build variables for one
/// core whose upstream Makefile keys its presets off the board rather than
/// the architecture.
pub struct CoreOverride {
    /// Resolves the platform token for a profile. Wins over the recipe's
    /// own platform field.
    pub platform_for: fn(&CpuTargetProfile) -> String,
    /// Fixed variable assignments appended after the recipe's own, so they
    /// override on duplicates.
    pub extra_args: fn(&CpuTargetProfile) -> Vec<String>,
}

/// Table from core name to its override.
#[derive(Default)]
pub struct Overrides {
    cores: HashMap<String, CoreOverride>,
}

impl Overrides {
    /// The overrides shipped with the tool.
    pub fn builtin() -> Overrides {
        let mut overrides = Overrides::default();
        overrides.insert(
            "mupen64plus_next",
            CoreOverride {
                platform_for: mupen64plus_platform,
                extra_args: mupen64plus_args,
            },
        );
        overrides
    }

    pub fn insert(&mut self, core: &str, over: CoreOverride) {
        self.cores.insert(core.to_string(), over);
    }

    pub fn get(&self, core: &str) -> Option<&CoreOverride> {
        self.cores.get(core)
    }
}

/// The upstream Makefile selects GLES paths and dynarec flavor per board.
/// Boards without a dedicated preset fall back to the generic `arm` preset
/// on 32-bit targets, or to the profile's default platform.
fn mupen64plus_platform(profile: &CpuTargetProfile) -> String {
    match profile.family.as_str() {
        "cortex-a73" => "odroid-n2".to_string(),
        "cortex-a72" => "rpi4_64".to_string(),
        "cortex-a35" => "classic_armv8_a35".to_string(),
        _ if profile.arch == Arch::Arm => "arm".to_string(),
        _ => profile.default_platform().to_string(),
    }
}

fn mupen64plus_args(profile: &CpuTargetProfile) -> Vec<String> {
    vec![
        "HAVE_THR_AL=1".to_string(),
        "FORCE_GLES=1".to_string(),
        format!("ARCH={}", profile.arch.make_arch()),
        "GL_LIB=-lGLESv2".to_string(),
    ]
}
