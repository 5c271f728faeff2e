//! CPU target profiles: the resolved toolchain and flag set for one family.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;

/// Architecture kind of a cross-compilation target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Arch {
    /// 32-bit ARM.
    Arm,
    /// 64-bit ARM.
    Arm64,
    Other,
}

impl Arch {
    fn parse(value: &str) -> Arch {
        match value {
            "arm" | "armv7" => Arch::Arm,
            "arm64" | "aarch64" => Arch::Arm64,
            _ => Arch::Other,
        }
    }

    /// Value used when the architecture is restated as a build variable
    /// (`ARCH=...`).
    pub fn make_arch(&self) -> &'static str {
        match self {
            Arch::Arm => "arm",
            Arch::Arm64 => "arm64",
            Arch::Other => "unknown",
        }
    }

    /// Target-processor hint for `CMAKE_SYSTEM_PROCESSOR`.
    pub fn cmake_processor(&self) -> &'static str {
        match self {
            Arch::Arm => "armv7l",
            Arch::Arm64 => "aarch64",
            Arch::Other => "generic",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    arch: Option<String>,
    toolchain: Option<String>,
    cflags: Option<String>,
    cxxflags: Option<String>,
    ldflags: Option<String>,
    platform: Option<String>,
}

/// Immutable description of one cross-compilation target, constructed from
/// configuration once per run.
#[derive(Clone, Debug)]
pub struct CpuTargetProfile {
    pub family: String,
    pub arch: Arch,
    /// Prefix from which compiler/archiver/linker executable names derive,
    /// e.g. `aarch64-linux-gnu-`.
    pub toolchain: String,
    pub cflags: String,
    pub cxxflags: String,
    pub ldflags: String,
    /// Default platform token; read through [`CpuTargetProfile::default_platform`].
    pub platform: String,
}

impl CpuTargetProfile {
    /// Reads `profiles.toml` and resolves one family.
    pub fn load(family: &str, profiles_path: &Path) -> Result<CpuTargetProfile> {
        let contents = std::fs::read_to_string(profiles_path).map_err(|err| {
            Error::Configuration(format!(
                "cannot read profiles file {}: {}",
                profiles_path.display(),
                err
            ))
        })?;

        let table: toml::Table = toml::from_str(&contents).map_err(|err| {
            Error::Configuration(format!(
                "invalid profiles file {}: {}",
                profiles_path.display(),
                err
            ))
        })?;

        let value = table
            .get(family)
            .ok_or_else(|| Error::Configuration(format!("unknown cpu family '{}'", family)))?;

        let raw: RawProfile = value.clone().try_into().map_err(|err| {
            Error::Configuration(format!("invalid profile for '{}': {}", family, err))
        })?;

        CpuTargetProfile::from_raw(family, raw)
    }

    fn from_raw(family: &str, raw: RawProfile) -> Result<CpuTargetProfile> {
        let missing = |field: &str| {
            Error::Configuration(format!("profile '{}' is missing '{}'", family, field))
        };

        let arch_value = raw.arch.ok_or_else(|| missing("arch"))?;
        let toolchain = raw.toolchain.ok_or_else(|| missing("toolchain"))?;
        let cflags = raw.cflags.ok_or_else(|| missing("cflags"))?;
        let cxxflags = raw.cxxflags.ok_or_else(|| missing("cxxflags"))?;

        let arch = Arch::parse(&arch_value);

        // A toolchain prefix and the declared architecture must agree.
        if toolchain.starts_with("arm-") && arch != Arch::Arm {
            return Err(Error::Configuration(format!(
                "profile '{}': 32-bit toolchain '{}' declared with arch '{}'",
                family, toolchain, arch_value
            )));
        }
        if toolchain.starts_with("aarch64-") && arch != Arch::Arm64 {
            return Err(Error::Configuration(format!(
                "profile '{}': 64-bit toolchain '{}' declared with arch '{}'",
                family, toolchain, arch_value
            )));
        }

        Ok(CpuTargetProfile {
            family: family.to_string(),
            arch,
            toolchain,
            cflags,
            cxxflags,
            ldflags: raw.ldflags.unwrap_or_default(),
            platform: raw.platform.unwrap_or_else(|| "unix".to_string()),
        })
    }

    /// Derives the environment every build subprocess runs with. Some
    /// third-party configure scripts refuse to run without a `TERM`.
    pub fn environment(&self) -> Vec<(String, String)> {
        vec![
            ("CC".to_string(), format!("{}gcc", self.toolchain)),
            ("CXX".to_string(), format!("{}g++", self.toolchain)),
            ("AR".to_string(), format!("{}ar", self.toolchain)),
            ("AS".to_string(), format!("{}as", self.toolchain)),
            ("STRIP".to_string(), format!("{}strip", self.toolchain)),
            ("CFLAGS".to_string(), self.cflags.clone()),
            ("CXXFLAGS".to_string(), self.cxxflags.clone()),
            ("LDFLAGS".to_string(), self.ldflags.clone()),
            ("TERM".to_string(), "xterm".to_string()),
        ]
    }

    /// Platform token used when a recipe does not pin one itself.
    pub fn default_platform(&self) -> &str {
        &self.platform
    }
}
