//! Shared front half of `package` and `deps`: open the image, activate
//! APEXes, seed and resolve the closure.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use android_exe_launcher::config::Config;
use android_exe_launcher::elf::{self, ElfTarget};
use android_exe_launcher::image::{self, apex, ImageHandle, ImageReader};
use android_exe_launcher::resolve::{DependencyGraph, Resolver, SearchPolicy, Seeds};
use android_exe_launcher::sdk::{self, DownloadOptions, ImageRequest};
use android_exe_launcher::timing::Timer;

/// What to compute the closure for.
#[derive(Debug, Clone)]
pub enum Target {
    /// An executable on the host filesystem.
    HostExe(PathBuf),
    /// An executable inside the image.
    ImageExe(String),
    /// Explicit sonames (defaults to the configured seed libraries).
    Libs(Vec<String>),
}

/// Command line overrides for configuration values.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub abi: Option<String>,
    pub search_path: Option<String>,
    pub exclude: Option<Vec<String>>,
    pub offset: Option<u64>,
    pub sdk: Option<PathBuf>,
    pub api: Option<u32>,
    pub rev: Option<u32>,
    pub jobs: Option<usize>,
}

impl Overrides {
    pub fn apply(self, config: &Config) -> Config {
        let mut config = config.clone();
        if let Some(abi) = self.abi {
            config.abi = abi;
        }
        if let Some(search_path) = self.search_path {
            config.search_path = search_path;
        }
        if let Some(exclude) = self.exclude {
            config.exclude = exclude;
        }
        if let Some(offset) = self.offset {
            config.image_offset = Some(offset);
        }
        if let Some(sdk) = self.sdk {
            config.sdk_root = Some(sdk);
        }
        if let Some(api) = self.api {
            config.api = Some(api);
        }
        if let Some(rev) = self.rev {
            config.image_rev = rev;
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs.max(1);
        }
        config
    }
}

/// An opened image and the closure resolved against it.
pub struct Resolved {
    pub handle: ImageHandle,
    pub graph: DependencyGraph,
    pub target: ElfTarget,
    pub policy: SearchPolicy,
}

/// The image to open: the given path, or the SDK image for the configured API.
pub fn locate_image(config: &Config, image_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = image_path {
        return Ok(path.to_path_buf());
    }
    let Some(api) = config.api else {
        bail!("No image given (use --image, or --api to take one from the Android SDK)");
    };

    let timer = Timer::start("Locate image");
    let request = ImageRequest {
        abi: config.abi.clone(),
        api,
        rev: config.image_rev,
    };
    let image = sdk::system_image(
        config.sdk_root.as_deref(),
        &request,
        &config.images_dir,
        &DownloadOptions::default(),
    )?;
    timer.finish();
    Ok(image)
}

pub fn resolve_target(
    config: &Config,
    image_path: Option<&Path>,
    target: &Target,
) -> Result<Resolved> {
    let elf_target = config.target()?;
    let policy = config.search_policy(elf_target.class);
    if policy.tiers.is_empty() {
        bail!("Search path '{}' has no directories", config.search_path);
    }

    fs::create_dir_all(&config.work_dir)
        .with_context(|| format!("Failed to create work dir {}", config.work_dir.display()))?;

    let image_path = locate_image(config, image_path)?;

    let timer = Timer::start("Open image");
    let mut handle = image::open(&image_path, config.image_offset, &config.work_dir)?;
    let activated = apex::activate(handle.reader_mut(), &config.apexes, &config.work_dir)?;
    for (name, activation) in activated {
        println!("  APEX {}: {:?}", name, activation);
    }
    timer.finish();

    let seeds = seeds(config, handle.reader(), &elf_target, target)?;
    println!(
        "Resolving {} ({} direct dependencies, {})...",
        seeds.root,
        seeds.needed.len(),
        elf_target
    );

    let timer = Timer::start("Resolve dependencies");
    let graph = Resolver::new(handle.reader(), &policy, elf_target)
        .with_jobs(config.jobs)
        .resolve(&seeds)
        .with_context(|| format!("Failed to resolve dependencies of {}", seeds.root))?;
    timer.finish();

    Ok(Resolved {
        handle,
        graph,
        target: elf_target,
        policy,
    })
}

fn seeds(
    config: &Config,
    image: &dyn ImageReader,
    elf_target: &ElfTarget,
    target: &Target,
) -> Result<Seeds> {
    match target {
        Target::HostExe(path) => {
            let bytes =
                fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
            let exe = elf::parse(&path.display().to_string(), &bytes, elf_target)?;
            let root = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            if exe.runpath_dirs().iter().any(|dir| dir.contains("ORIGIN")) {
                eprintln!(
                    "  [WARN] {} uses $ORIGIN in DT_RUNPATH; ignored for a host executable",
                    root
                );
            }
            Ok(Seeds::from_executable(
                &root,
                &exe,
                None,
                config.interpreter.clone(),
            ))
        }
        Target::ImageExe(path) => {
            let canonical = image.canonicalize(path)?;
            let bytes = image.read(&canonical)?;
            let exe = elf::parse(&canonical, &bytes, elf_target)?;
            let origin = image::parent(&canonical);
            Ok(Seeds::from_executable(
                image::file_name(path),
                &exe,
                Some(&origin),
                config.interpreter.clone(),
            ))
        }
        Target::Libs(sonames) => {
            let sonames = if sonames.is_empty() {
                config.seed_libs.clone()
            } else {
                sonames.clone()
            };
            if sonames.is_empty() {
                bail!("No executable and no libraries given (set LAUNCHER_SEED_LIBS or use --lib)");
            }
            Ok(Seeds::from_sonames(
                "seed-libs",
                sonames,
                Some(config.interpreter_path(elf_target.class)),
            ))
        }
    }
}
