//! Pure command composition: a CPU profile plus a core recipe become the
//! exact build-tool invocations, with all override rules resolved.

pub mod overrides;

use crate::error::{Error, Result};
use crate::profile::{Arch, CpuTargetProfile};
use crate::recipe::CoreRecipe;
use overrides::Overrides;
use std::path::{Path, PathBuf};

/// A single subprocess invocation, fully specified and ephemeral.
#[derive(Clone, Debug)]
pub struct ComposedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

/// Build-system kind a recipe resolves to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildKind {
    Make,
    Cmake,
}

/// Resolves and validates a recipe's build-system kind.
pub fn build_kind(core: &str, recipe: &CoreRecipe) -> Result<BuildKind> {
    match recipe.build.as_deref() {
        Some("make") => Ok(BuildKind::Make),
        Some("cmake") => Ok(BuildKind::Cmake),
        Some(other) => Err(Error::Composition(format!(
            "core '{}' declares unknown build kind '{}'",
            core, other
        ))),
        None => Err(Error::Composition(format!(
            "core '{}' recipe is missing 'build'",
            core
        ))),
    }
}

/// Ordered argument list keyed by variable name, with explicit
/// last-value-wins overwrite semantics. Precedence lives here instead of in
/// append order; the list flattens to tokens only at the invocation
/// boundary.
#[derive(Debug, Default)]
pub struct OrderedArgs {
    items: Vec<(Option<String>, String)>,
}

impl OrderedArgs {
    /// Inserts, or updates in place keeping the original position.
    pub fn set(&mut self, key: &str, token: String) {
        match self
            .items
            .iter_mut()
            .find(|(k, _)| k.as_deref() == Some(key))
        {
            Some(item) => item.1 = token,
            None => self.items.push((Some(key.to_string()), token)),
        }
    }

    /// Removes any existing entry for `key` and appends at the end: the
    /// value wins and is visibly last in the flattened list.
    pub fn force(&mut self, key: &str, token: String) {
        self.items.retain(|(k, _)| k.as_deref() != Some(key));
        self.items.push((Some(key.to_string()), token));
    }

    /// Appends an unkeyed token; never deduplicated.
    pub fn push_raw(&mut self, token: String) {
        self.items.push((None, token));
    }

    pub fn contains_key_prefix(&self, prefix: &str) -> bool {
        self.items
            .iter()
            .any(|(k, _)| k.as_deref().is_some_and(|k| k.starts_with(prefix)))
    }

    pub fn into_tokens(self) -> Vec<String> {
        self.items.into_iter().map(|(_, token)| token).collect()
    }
}

/// A recipe platform is usable when present, non-empty, and fully expanded;
/// scraped recipes sometimes carry an unexpanded `$(...)` reference.
fn resolve_platform(recipe_platform: Option<&str>, profile: &CpuTargetProfile) -> String {
    match recipe_platform {
        Some(platform) if !platform.is_empty() && !platform.contains("$(") => {
            platform.to_string()
        }
        _ => profile.default_platform().to_string(),
    }
}

fn push_make_token(args: &mut OrderedArgs, token: String) {
    match token.split_once('=').map(|(key, _)| key.to_string()) {
        Some(key) => args.set(&key, token),
        None => args.push_raw(token),
    }
}

/// Variable assignments for a make-kind build, in precedence order:
/// toolchain assignments first (several upstream platform presets never set
/// a compiler), then the resolved platform, then the recipe's own
/// assignments, then per-core override assignments, which win.
pub fn compose_make_args(
    profile: &CpuTargetProfile,
    core: &str,
    recipe: &CoreRecipe,
    overrides: &Overrides,
) -> Vec<String> {
    let mut args = OrderedArgs::default();

    args.set("CC", format!("CC={}gcc", profile.toolchain));
    args.set("CXX", format!("CXX={}g++", profile.toolchain));
    args.set("AR", format!("AR={}ar", profile.toolchain));

    let over = overrides.get(core);

    let platform = match over {
        Some(over) => (over.platform_for)(profile),
        None => resolve_platform(recipe.platform.as_deref(), profile),
    };
    args.set("platform", format!("platform={}", platform));

    for arg in &recipe.args {
        push_make_token(&mut args, arg.clone());
    }

    if let Some(over) = over {
        for arg in (over.extra_args)(profile) {
            match arg.split_once('=').map(|(key, _)| key.to_string()) {
                Some(key) => args.force(&key, arg),
                None => args.push_raw(arg),
            }
        }
    }

    args.into_tokens()
}

fn make_fields<'a>(core: &str, recipe: &'a CoreRecipe) -> Result<(&'a str, &'a str)> {
    let workdir = recipe.workdir.as_deref().ok_or_else(|| {
        Error::Composition(format!("core '{}' recipe is missing 'workdir'", core))
    })?;
    let makefile = recipe.makefile.as_deref().ok_or_else(|| {
        Error::Composition(format!("core '{}' recipe is missing 'makefile'", core))
    })?;
    Ok((workdir, makefile))
}

/// The full make invocation for one core.
pub fn make_command(
    profile: &CpuTargetProfile,
    core: &str,
    recipe: &CoreRecipe,
    overrides: &Overrides,
    core_dir: &Path,
    jobs: usize,
) -> Result<ComposedCommand> {
    let (workdir, makefile) = make_fields(core, recipe)?;

    let mut args = vec!["-f".to_string(), makefile.to_string(), format!("-j{}", jobs)];
    args.extend(compose_make_args(profile, core, recipe, overrides));

    Ok(ComposedCommand {
        program: "make".to_string(),
        args,
        current_dir: core_dir.join(workdir),
        env: profile.environment(),
    })
}

/// The clean invocation: same variable assignments, bare `clean` target.
pub fn make_clean_command(
    profile: &CpuTargetProfile,
    core: &str,
    recipe: &CoreRecipe,
    overrides: &Overrides,
    core_dir: &Path,
) -> Result<ComposedCommand> {
    let (workdir, makefile) = make_fields(core, recipe)?;

    let mut args = vec!["-f".to_string(), makefile.to_string()];
    args.extend(compose_make_args(profile, core, recipe, overrides));
    args.push("clean".to_string());

    Ok(ComposedCommand {
        program: "make".to_string(),
        args,
        current_dir: core_dir.join(workdir),
        env: profile.environment(),
    })
}

fn cmake_define_key(token: &str) -> Option<&str> {
    token
        .strip_prefix("-D")
        .unwrap_or(token)
        .split_once('=')
        .map(|(key, _)| key)
}

fn push_cmake_token(args: &mut OrderedArgs, token: String) {
    match cmake_define_key(&token).map(str::to_string) {
        Some(key) => args.set(&key, token),
        None => args.push_raw(token),
    }
}

/// Configuration options for a cmake-kind build.
///
/// Recipe options come first; the profile's cross-compilation settings are
/// keyed over them so a stray recipe entry cannot shadow the toolchain. A
/// build type is defaulted only when no option already names
/// `CMAKE_BUILD_TYPE`, and 32-bit targets get their language standards
/// pinned last (the 32-bit toolchain miscompiles newer standard levels).
pub fn compose_cmake_args(
    profile: &CpuTargetProfile,
    options: &[String],
    prefix_path: Option<&str>,
) -> Vec<String> {
    let mut args = OrderedArgs::default();

    // One recipe entry may pack several tokens, including a detached
    // "-D NAME=VALUE" pair.
    let tokens: Vec<&str> = options
        .iter()
        .flat_map(|option| option.split_whitespace())
        .collect();
    let mut index = 0;
    while index < tokens.len() {
        if tokens[index] == "-D" && index + 1 < tokens.len() {
            push_cmake_token(&mut args, format!("-D{}", tokens[index + 1]));
            index += 2;
            continue;
        }
        push_cmake_token(&mut args, tokens[index].to_string());
        index += 1;
    }

    args.set(
        "CMAKE_C_COMPILER",
        format!("-DCMAKE_C_COMPILER={}gcc", profile.toolchain),
    );
    args.set(
        "CMAKE_CXX_COMPILER",
        format!("-DCMAKE_CXX_COMPILER={}g++", profile.toolchain),
    );
    args.set(
        "CMAKE_C_FLAGS",
        format!("-DCMAKE_C_FLAGS={}", profile.cflags),
    );
    args.set(
        "CMAKE_CXX_FLAGS",
        format!("-DCMAKE_CXX_FLAGS={}", profile.cxxflags),
    );
    args.set(
        "CMAKE_SYSTEM_PROCESSOR",
        format!("-DCMAKE_SYSTEM_PROCESSOR={}", profile.arch.cmake_processor()),
    );
    args.set(
        "THREADS_PREFER_PTHREAD_FLAG",
        "-DTHREADS_PREFER_PTHREAD_FLAG=ON".to_string(),
    );

    if !args.contains_key_prefix("CMAKE_BUILD_TYPE") {
        args.set(
            "CMAKE_BUILD_TYPE",
            "-DCMAKE_BUILD_TYPE=Release".to_string(),
        );
    }

    if profile.arch == Arch::Arm {
        args.force("CMAKE_C_STANDARD", "-DCMAKE_C_STANDARD=11".to_string());
        args.force("CMAKE_CXX_STANDARD", "-DCMAKE_CXX_STANDARD=14".to_string());
    }

    if let Some(path) = prefix_path {
        args.force(
            "CMAKE_PREFIX_PATH",
            format!("-DCMAKE_PREFIX_PATH={}", path),
        );
    }

    args.into_tokens()
}

/// The cmake configure invocation, run inside the fresh `build/` directory
/// against the parent source tree.
pub fn cmake_configure_command(
    profile: &CpuTargetProfile,
    recipe: &CoreRecipe,
    core_dir: &Path,
    prefix_path: Option<&str>,
) -> ComposedCommand {
    let mut args = vec!["..".to_string()];
    args.extend(compose_cmake_args(profile, &recipe.options, prefix_path));

    ComposedCommand {
        program: "cmake".to_string(),
        args,
        current_dir: core_dir.join("build"),
        env: profile.environment(),
    }
}

/// The build-tool invocation that follows a successful cmake configure.
pub fn cmake_build_command(
    profile: &CpuTargetProfile,
    core_dir: &Path,
    jobs: usize,
) -> ComposedCommand {
    ComposedCommand {
        program: "make".to_string(),
        args: vec![format!("-j{}", jobs)],
        current_dir: core_dir.join("build"),
        env: profile.environment(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(family: &str, arch: Arch) -> CpuTargetProfile {
        let toolchain = match arch {
            Arch::Arm => "arm-linux-gnueabihf-",
            _ => "aarch64-linux-gnu-",
        };
        CpuTargetProfile {
            family: family.to_string(),
            arch,
            toolchain: toolchain.to_string(),
            cflags: "-O2".to_string(),
            cxxflags: "-O2".to_string(),
            ldflags: String::new(),
            platform: "unix".to_string(),
        }
    }

    fn make_recipe(platform: Option<&str>, args: &[&str]) -> CoreRecipe {
        CoreRecipe {
            build: Some("make".to_string()),
            workdir: Some(".".to_string()),
            makefile: Some("Makefile.libretro".to_string()),
            platform: platform.map(str::to_string),
            args: args.iter().map(|a| a.to_string()).collect(),
            artifact: Some("core_libretro.so".to_string()),
            ..CoreRecipe::default()
        }
    }

    #[test]
    fn ordered_args_overwrite_in_place_and_force_to_end() {
        let mut args = OrderedArgs::default();
        args.set("A", "A=1".to_string());
        args.set("B", "B=1".to_string());
        args.set("A", "A=2".to_string());
        assert_eq!(args.into_tokens(), vec!["A=2", "B=1"]);

        let mut args = OrderedArgs::default();
        args.set("A", "A=1".to_string());
        args.set("B", "B=1".to_string());
        args.force("A", "A=2".to_string());
        assert_eq!(args.into_tokens(), vec!["B=1", "A=2"]);
    }

    // Toolchain assignments precede the platform token, which precedes the
    // recipe's own arguments.
    #[test]
    fn make_toolchain_precedes_platform_precedes_extras() {
        let p = profile("cortex-a53", Arch::Arm64);
        let recipe = make_recipe(Some("unix"), &["FOO=1", "BAR=2"]);
        let args = compose_make_args(&p, "fceumm", &recipe, &Overrides::default());

        let pos = |needle: &str| args.iter().position(|a| a == needle).unwrap();
        assert!(pos("CC=aarch64-linux-gnu-gcc") < pos("platform=unix"));
        assert!(pos("CXX=aarch64-linux-gnu-g++") < pos("platform=unix"));
        assert!(pos("AR=aarch64-linux-gnu-ar") < pos("platform=unix"));
        assert!(pos("platform=unix") < pos("FOO=1"));
        assert!(pos("FOO=1") < pos("BAR=2"));
    }

    #[test]
    fn make_platform_falls_back_when_absent_or_unexpanded() {
        let p = profile("cortex-a53", Arch::Arm64);
        let overrides = Overrides::default();

        for recipe_platform in [None, Some("$(LIBRETRO_PLATFORM)"), Some("")] {
            let recipe = make_recipe(recipe_platform, &[]);
            let args = compose_make_args(&p, "fceumm", &recipe, &overrides);
            assert!(
                args.contains(&"platform=unix".to_string()),
                "platform {:?} should fall back",
                recipe_platform
            );
        }

        let recipe = make_recipe(Some("unix"), &[]);
        let args = compose_make_args(&p, "fceumm", &recipe, &overrides);
        assert!(args.contains(&"platform=unix".to_string()));
    }

    #[test]
    fn make_command_prefixes_makefile_and_jobs() {
        let p = profile("cortex-a53", Arch::Arm64);
        let recipe = make_recipe(Some("unix"), &["FOO=1"]);
        let command =
            make_command(&p, "core1", &recipe, &Overrides::default(), Path::new("/src/core1"), 8)
                .unwrap();

        assert_eq!(command.program, "make");
        assert_eq!(command.args[..3], ["-f", "Makefile.libretro", "-j8"]);
        assert_eq!(command.args[3], "CC=aarch64-linux-gnu-gcc");
        assert_eq!(command.args[4], "CXX=aarch64-linux-gnu-g++");
        assert!(command.args.contains(&"platform=unix".to_string()));
        assert_eq!(command.args.last().unwrap(), "FOO=1");
        assert_eq!(command.current_dir, Path::new("/src/core1"));
    }

    #[test]
    fn make_clean_command_ends_with_clean() {
        let p = profile("cortex-a53", Arch::Arm64);
        let recipe = make_recipe(Some("unix"), &[]);
        let command =
            make_clean_command(&p, "core1", &recipe, &Overrides::default(), Path::new("/s"))
                .unwrap();

        assert_eq!(command.args[..2], ["-f", "Makefile.libretro"]);
        assert_eq!(command.args.last().unwrap(), "clean");
        assert!(!command.args.iter().any(|a| a.starts_with("-j")));
    }

    #[test]
    fn missing_makefile_is_a_composition_error() {
        let p = profile("cortex-a53", Arch::Arm64);
        let mut recipe = make_recipe(Some("unix"), &[]);
        recipe.makefile = None;

        let err = make_command(&p, "core1", &recipe, &Overrides::default(), Path::new("/s"), 4)
            .unwrap_err();
        assert!(matches!(err, Error::Composition(_)));
        assert!(err.to_string().contains("makefile"));
    }

    #[test]
    fn unknown_build_kind_fails_fast() {
        let recipe = CoreRecipe {
            build: Some("meson".to_string()),
            ..CoreRecipe::default()
        };
        assert!(matches!(
            build_kind("core1", &recipe),
            Err(Error::Composition(_))
        ));
        assert!(matches!(
            build_kind("core1", &CoreRecipe::default()),
            Err(Error::Composition(_))
        ));
    }

    #[test]
    fn cmake_recipe_build_type_suppresses_the_default() {
        let p = profile("cortex-a53", Arch::Arm64);
        let options = vec!["-DCMAKE_BUILD_TYPE=RelWithDebInfo".to_string()];
        let args = compose_cmake_args(&p, &options, None);

        let build_type: Vec<&String> = args
            .iter()
            .filter(|a| a.starts_with("-DCMAKE_BUILD_TYPE"))
            .collect();
        assert_eq!(build_type, vec!["-DCMAKE_BUILD_TYPE=RelWithDebInfo"]);
    }

    #[test]
    fn cmake_defaults_build_type_when_unset() {
        let p = profile("cortex-a53", Arch::Arm64);
        let args = compose_cmake_args(&p, &["-DLIBRETRO=ON".to_string()], None);
        assert!(args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
    }

    #[test]
    fn cmake_splits_packed_option_strings() {
        let p = profile("cortex-a53", Arch::Arm64);
        let options = vec!["-DLIBRETRO=ON -D CMAKE_BUILD_TYPE=MinSizeRel".to_string()];
        let args = compose_cmake_args(&p, &options, None);

        assert!(args.contains(&"-DLIBRETRO=ON".to_string()));
        assert!(args.contains(&"-DCMAKE_BUILD_TYPE=MinSizeRel".to_string()));
        assert!(!args.contains(&"-DCMAKE_BUILD_TYPE=Release".to_string()));
    }

    // 32-bit targets always end with the pinned language standards, even
    // when the recipe asked for newer ones.
    #[test]
    fn cmake_32bit_standard_overrides_win_and_come_last() {
        let p = profile("cortex-a7", Arch::Arm);
        let options = vec![
            "-DCMAKE_CXX_STANDARD=17".to_string(),
            "-DCMAKE_C_STANDARD=17".to_string(),
        ];
        let args = compose_cmake_args(&p, &options, None);

        assert_eq!(args[args.len() - 2], "-DCMAKE_C_STANDARD=11");
        assert_eq!(args[args.len() - 1], "-DCMAKE_CXX_STANDARD=14");
        assert!(!args.contains(&"-DCMAKE_C_STANDARD=17".to_string()));
        assert!(!args.contains(&"-DCMAKE_CXX_STANDARD=17".to_string()));
    }

    #[test]
    fn cmake_64bit_does_not_pin_standards() {
        let p = profile("cortex-a53", Arch::Arm64);
        let args = compose_cmake_args(&p, &[], None);
        assert!(!args.iter().any(|a| a.starts_with("-DCMAKE_C_STANDARD")));
        assert!(!args.iter().any(|a| a.starts_with("-DCMAKE_CXX_STANDARD")));
    }

    #[test]
    fn cmake_cross_settings_follow_recipe_options() {
        let p = profile("cortex-a53", Arch::Arm64);
        let args = compose_cmake_args(&p, &["-DLIBRETRO=ON".to_string()], None);

        let pos = |needle: &str| args.iter().position(|a| a.starts_with(needle)).unwrap();
        assert!(pos("-DLIBRETRO=ON") < pos("-DCMAKE_C_COMPILER"));
        assert!(args.contains(&"-DCMAKE_C_COMPILER=aarch64-linux-gnu-gcc".to_string()));
        assert!(args.contains(&"-DCMAKE_SYSTEM_PROCESSOR=aarch64".to_string()));
        assert!(args.contains(&"-DTHREADS_PREFER_PTHREAD_FLAG=ON".to_string()));
    }

    #[test]
    fn cmake_prefix_path_is_appended_last_when_present() {
        let p = profile("cortex-a53", Arch::Arm64);
        let args = compose_cmake_args(&p, &[], Some("/opt/sysroot"));
        assert_eq!(args.last().unwrap(), "-DCMAKE_PREFIX_PATH=/opt/sysroot");
    }

    #[test]
    fn cmake_configure_command_targets_parent_directory() {
        let p = profile("cortex-a53", Arch::Arm64);
        let recipe = CoreRecipe {
            build: Some("cmake".to_string()),
            options: vec!["-DLIBRETRO=ON".to_string()],
            artifact: Some("build/core_libretro.so".to_string()),
            ..CoreRecipe::default()
        };
        let command = cmake_configure_command(&p, &recipe, Path::new("/src/core"), None);

        assert_eq!(command.program, "cmake");
        assert_eq!(command.args[0], "..");
        assert_eq!(command.current_dir, Path::new("/src/core/build"));

        let build = cmake_build_command(&p, Path::new("/src/core"), 6);
        assert_eq!(build.program, "make");
        assert_eq!(build.args, vec!["-j6"]);
        assert_eq!(build.current_dir, Path::new("/src/core/build"));
    }

    // The worked end-to-end example: cortex-a53 / core1.
    #[test]
    fn end_to_end_example_ordering() {
        let p = profile("cortex-a53", Arch::Arm64);
        let recipe = make_recipe(Some("unix"), &["FOO=1"]);
        let args = compose_make_args(&p, "core1", &recipe, &Overrides::default());

        assert_eq!(args[0], "CC=aarch64-linux-gnu-gcc");
        assert_eq!(args[1], "CXX=aarch64-linux-gnu-g++");
        assert!(args.contains(&"platform=unix".to_string()));
        assert_eq!(args.last().unwrap(), "FOO=1");
    }
}
