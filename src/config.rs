//! Configuration management for android-exe-launcher.
//!
//! Reads configuration from a .env file and environment variables.
//! Environment variables take precedence over the .env file; command line
//! flags take precedence over both.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread;

use crate::elf::{ElfClass, ElfTarget};
use crate::resolve::SearchPolicy;

pub const DEFAULT_ABI: &str = "arm64-v8a";

/// `:` separates tiers, `|` joins directories of equal priority.
pub const DEFAULT_SEARCH_PATH: &str =
    "/system/${LIB}:/vendor/${LIB}:/apex/com.android.runtime/${LIB}/bionic";

/// Provided by the dynamic linker itself.
pub const DEFAULT_EXCLUDE: &str = "ld-android.so";

/// Bionic, enough to start most executables.
pub const DEFAULT_SEED_LIBS: &str = "libc.so,libm.so,libdl.so";

pub const DEFAULT_APEXES: &str = "com.android.runtime";

/// Launcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Android ABI of the target (e.g. "arm64-v8a")
    pub abi: String,
    /// Library search tiers, unexpanded
    pub search_path: String,
    /// Sonames never packaged
    pub exclude: Vec<String>,
    /// Interpreter image path; None means the ABI's default linker
    pub interpreter: Option<String>,
    /// Sonames packaged when no executable is given
    pub seed_libs: Vec<String>,
    /// APEXes made visible under /apex before resolving
    pub apexes: Vec<String>,
    /// Byte offset of the filesystem inside a raw image file; None detects it
    pub image_offset: Option<u64>,
    /// Android SDK root searched for installed system images
    pub sdk_root: Option<PathBuf>,
    /// API level of the SDK system image used when no --image is given
    pub api: Option<u32>,
    /// Required system image revision; 0 accepts whatever the SDK has
    pub image_rev: u32,
    /// Downloaded and extracted SDK system images
    pub images_dir: PathBuf,
    /// Mount points and APEX extractions live here
    pub work_dir: PathBuf,
    /// Worker threads for resolution and assembly
    pub jobs: usize,
}

impl Config {
    /// Load configuration from `<base_dir>/.env` and the environment.
    pub fn load(base_dir: &Path) -> Self {
        let mut env_vars = HashMap::new();

        let env_path = base_dir.join(".env");
        if env_path.exists() {
            match dotenvy::from_path_iter(&env_path) {
                Ok(iter) => {
                    for item in iter {
                        match item {
                            Ok((key, value)) => {
                                env_vars.insert(key, value);
                            }
                            Err(e) => eprintln!(
                                "  [WARN] Ignoring bad line in {}: {}",
                                env_path.display(),
                                e
                            ),
                        }
                    }
                }
                Err(e) => eprintln!("  [WARN] Cannot read {}: {}", env_path.display(), e),
            }
        }

        // Environment variables override .env file
        for (key, value) in std::env::vars() {
            env_vars.insert(key, value);
        }

        Self::from_vars(&env_vars)
    }

    /// Build a config from already-collected variables, filling defaults.
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let work_dir = get("LAUNCHER_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::cache_dir()
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join("android-exe-launcher")
            });

        Self {
            abi: get("LAUNCHER_ABI").unwrap_or(DEFAULT_ABI).to_string(),
            search_path: get("LAUNCHER_SEARCH_PATH")
                .unwrap_or(DEFAULT_SEARCH_PATH)
                .to_string(),
            exclude: split_list(get("LAUNCHER_EXCLUDE").unwrap_or(DEFAULT_EXCLUDE)),
            interpreter: get("LAUNCHER_INTERPRETER").map(str::to_string),
            seed_libs: split_list(get("LAUNCHER_SEED_LIBS").unwrap_or(DEFAULT_SEED_LIBS)),
            apexes: split_list(get("LAUNCHER_APEXES").unwrap_or(DEFAULT_APEXES)),
            image_offset: parse_offset(get("LAUNCHER_IMAGE_OFFSET")),
            sdk_root: get("LAUNCHER_SDK")
                .or_else(|| get("ANDROID_SDK_HOME"))
                .or_else(|| get("ANDROID_SDK_ROOT"))
                .map(PathBuf::from),
            api: get("LAUNCHER_API").and_then(|v| match v.parse() {
                Ok(api) => Some(api),
                Err(_) => {
                    eprintln!("  [WARN] Ignoring invalid LAUNCHER_API");
                    None
                }
            }),
            image_rev: parse_or("LAUNCHER_IMAGE_REV", get("LAUNCHER_IMAGE_REV"), 0),
            images_dir: get("LAUNCHER_IMAGES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| work_dir.join("system-images")),
            work_dir,
            jobs: parse_or("LAUNCHER_JOBS", get("LAUNCHER_JOBS"), default_jobs()).max(1),
        }
    }

    /// ELF class, byte order and machine for the configured ABI.
    pub fn target(&self) -> Result<ElfTarget> {
        ElfTarget::from_abi(&self.abi).with_context(|| {
            format!(
                "Unknown ABI '{}' (expected arm64-v8a, armeabi-v7a, x86_64 or x86)",
                self.abi
            )
        })
    }

    /// Interpreter image path, defaulting per class.
    pub fn interpreter_path(&self, class: ElfClass) -> String {
        self.interpreter.clone().unwrap_or_else(|| match class {
            ElfClass::Elf64 => "/system/bin/linker64".to_string(),
            ElfClass::Elf32 => "/system/bin/linker".to_string(),
        })
    }

    pub fn search_policy(&self, class: ElfClass) -> SearchPolicy {
        SearchPolicy::new(
            SearchPolicy::parse_tiers(&self.search_path, class),
            self.exclude.iter().cloned(),
        )
    }

    /// Print configuration for debugging.
    pub fn print(&self) {
        println!("Configuration:");
        println!("  LAUNCHER_ABI: {}", self.abi);
        println!("  LAUNCHER_SEARCH_PATH: {}", self.search_path);
        println!("  LAUNCHER_EXCLUDE: {}", self.exclude.join(","));
        match self.target() {
            Ok(target) => {
                println!(
                    "  LAUNCHER_INTERPRETER: {}",
                    self.interpreter_path(target.class)
                );
                println!("  Target: {}", target);
                for (i, tier) in self.search_policy(target.class).tiers.iter().enumerate() {
                    println!("    tier {}: {}", i + 1, tier.join(" | "));
                }
            }
            Err(e) => println!("  Target: INVALID ({})", e),
        }
        println!("  LAUNCHER_SEED_LIBS: {}", self.seed_libs.join(","));
        println!("  LAUNCHER_APEXES: {}", self.apexes.join(","));
        match self.image_offset {
            Some(offset) => println!("  LAUNCHER_IMAGE_OFFSET: {}", offset),
            None => println!("  LAUNCHER_IMAGE_OFFSET: auto"),
        }
        match &self.sdk_root {
            Some(sdk) => println!("  LAUNCHER_SDK: {}", sdk.display()),
            None => println!("  LAUNCHER_SDK: (not set)"),
        }
        match self.api {
            Some(api) => println!("  LAUNCHER_API: {}", api),
            None => println!("  LAUNCHER_API: (not set)"),
        }
        println!("  LAUNCHER_IMAGE_REV: {}", self.image_rev);
        println!("  LAUNCHER_IMAGES_DIR: {}", self.images_dir.display());
        println!("  LAUNCHER_WORK_DIR: {}", self.work_dir.display());
        println!("  LAUNCHER_JOBS: {}", self.jobs);
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_or<T: std::str::FromStr + Copy>(key: &str, value: Option<&str>, default: T) -> T {
    match value.map(str::parse::<T>) {
        Some(Ok(parsed)) => parsed,
        Some(Err(_)) => {
            eprintln!("  [WARN] Ignoring invalid {}, using default", key);
            default
        }
        None => default,
    }
}

/// Unset or "auto" means detect the offset from the image.
fn parse_offset(value: Option<&str>) -> Option<u64> {
    match value {
        None | Some("auto") => None,
        Some(v) => match v.parse() {
            Ok(offset) => Some(offset),
            Err(_) => {
                eprintln!("  [WARN] Ignoring invalid LAUNCHER_IMAGE_OFFSET, detecting it instead");
                None
            }
        },
    }
}

fn default_jobs() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_vars(&HashMap::new());
        assert_eq!(config.abi, "arm64-v8a");
        assert_eq!(config.exclude, vec!["ld-android.so"]);
        assert_eq!(config.seed_libs, vec!["libc.so", "libm.so", "libdl.so"]);
        assert_eq!(config.image_offset, None);
        assert_eq!(config.image_rev, 0);
        assert!(config.images_dir.ends_with("system-images"));
        assert!(config.jobs >= 1);
        assert_eq!(config.target().unwrap(), ElfTarget::ARM64);
        assert_eq!(
            config.interpreter_path(ElfClass::Elf64),
            "/system/bin/linker64"
        );

        let policy = config.search_policy(ElfClass::Elf64);
        assert_eq!(policy.tiers.len(), 3);
        assert_eq!(policy.tiers[0], vec!["/system/lib64"]);
        assert!(policy.is_excluded("ld-android.so"));
    }

    #[test]
    fn test_overrides_and_bad_numbers() {
        let config = Config::from_vars(&vars(&[
            ("LAUNCHER_ABI", "armeabi-v7a"),
            ("LAUNCHER_EXCLUDE", "ld-android.so, libnativebridge.so ,"),
            ("LAUNCHER_IMAGE_OFFSET", "1048576"),
            ("LAUNCHER_JOBS", "many"),
        ]));
        assert_eq!(config.target().unwrap(), ElfTarget::ARM);
        assert_eq!(config.exclude, vec!["ld-android.so", "libnativebridge.so"]);
        assert_eq!(config.image_offset, Some(1_048_576));
        assert_eq!(config.jobs, default_jobs());
        assert_eq!(config.interpreter_path(ElfClass::Elf32), "/system/bin/linker");
    }

    #[test]
    fn test_sdk_settings() {
        let config = Config::from_vars(&vars(&[
            ("ANDROID_SDK_ROOT", "/opt/android-sdk"),
            ("LAUNCHER_API", "33"),
            ("LAUNCHER_IMAGE_REV", "8"),
            ("LAUNCHER_IMAGE_OFFSET", "auto"),
            ("LAUNCHER_WORK_DIR", "/var/tmp/launcher"),
        ]));
        assert_eq!(config.sdk_root, Some(PathBuf::from("/opt/android-sdk")));
        assert_eq!(config.api, Some(33));
        assert_eq!(config.image_rev, 8);
        assert_eq!(config.image_offset, None);
        assert_eq!(
            config.images_dir,
            PathBuf::from("/var/tmp/launcher/system-images")
        );

        // LAUNCHER_SDK wins over ANDROID_SDK_HOME, which wins over ANDROID_SDK_ROOT.
        let config = Config::from_vars(&vars(&[
            ("ANDROID_SDK_ROOT", "/opt/root"),
            ("ANDROID_SDK_HOME", "/opt/home"),
        ]));
        assert_eq!(config.sdk_root, Some(PathBuf::from("/opt/home")));
        let config = Config::from_vars(&vars(&[
            ("ANDROID_SDK_HOME", "/opt/home"),
            ("LAUNCHER_SDK", "/opt/launcher"),
            ("LAUNCHER_IMAGE_OFFSET", "0x100"),
        ]));
        assert_eq!(config.sdk_root, Some(PathBuf::from("/opt/launcher")));
        assert_eq!(config.image_offset, None);
    }

    #[test]
    fn test_unknown_abi() {
        let config = Config::from_vars(&vars(&[("LAUNCHER_ABI", "mips")]));
        assert!(config.target().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides_dotenv() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join(".env"),
            "# local setup\nLAUNCHER_SEED_LIBS=liblog.so\nLAUNCHER_APEXES=\"com.android.art\"\n",
        )
        .unwrap();

        std::env::set_var("LAUNCHER_SEED_LIBS", "libz.so,libc.so");
        let config = Config::load(temp.path());
        std::env::remove_var("LAUNCHER_SEED_LIBS");

        assert_eq!(config.seed_libs, vec!["libz.so", "libc.so"]);
        assert_eq!(config.apexes, vec!["com.android.art"]);
    }
}
