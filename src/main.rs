//! android-exe-launcher - Android launcher package builder.
//!
//! Extracts the dynamic linker and the exact library closure of an
//! Android executable from a system image:
//! - resolves DT_NEEDED the way bionic does (DT_RUNPATH, then search tiers)
//! - lays libraries out flat, rewriting embedded search paths in place
//! - writes the package atomically with a manifest

mod commands;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use android_exe_launcher::config::Config;
use commands::target::{Overrides, Target};

#[derive(Parser)]
#[command(name = "android-exe-launcher")]
#[command(about = "Builds launcher packages for running Android executables under qemu-user")]
#[command(
    after_help = "QUICK START:\n  android-exe-launcher preflight                           Check host tools\n  android-exe-launcher package --image system.img --exe ./tool\n  android-exe-launcher package --api 30 --rev 8 --image-exe /system/bin/toybox\n  android-exe-launcher deps --image system/ --lib libbinder.so"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a launcher package
    Package {
        #[command(flatten)]
        source: SourceArgs,

        /// Output directory (default: <name>.launcher)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the resolved dependency graph without writing anything
    Deps {
        #[command(flatten)]
        source: SourceArgs,
    },

    /// Print what the ELF parser sees in a file
    Inspect {
        /// ELF file on the host
        file: PathBuf,

        /// Android ABI to check against (default: LAUNCHER_ABI)
        #[arg(long)]
        abi: Option<String>,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show information
    Show {
        #[command(subcommand)]
        what: ShowTarget,
    },

    /// Run preflight checks (host tools and configuration)
    Preflight {
        /// Fail if any checks fail (exit code 1)
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand)]
enum ShowTarget {
    /// Show current configuration
    Config,
    /// Summarize an assembled package
    Package {
        /// Package directory
        dir: PathBuf,
    },
}

/// Image, target selection and configuration overrides.
#[derive(Args)]
struct SourceArgs {
    /// System image: extracted directory or raw image file
    /// (default: the SDK image for --api)
    #[arg(long, conflicts_with_all = ["sdk", "api", "rev"])]
    image: Option<PathBuf>,

    /// Android SDK root (default: LAUNCHER_SDK, ANDROID_SDK_HOME, ANDROID_SDK_ROOT)
    #[arg(long)]
    sdk: Option<PathBuf>,

    /// API level of the SDK system image to use or download
    #[arg(long)]
    api: Option<u32>,

    /// System image revision; required to download
    #[arg(long)]
    rev: Option<u32>,

    /// Executable on the host
    #[arg(long, conflicts_with_all = ["image_exe", "lib"])]
    exe: Option<PathBuf>,

    /// Executable inside the image (e.g. /system/bin/toybox)
    #[arg(long, conflicts_with = "lib")]
    image_exe: Option<String>,

    /// Soname to package (repeatable; default: LAUNCHER_SEED_LIBS)
    #[arg(long, value_name = "SONAME")]
    lib: Vec<String>,

    /// Android ABI (arm64-v8a, armeabi-v7a, x86_64, x86)
    #[arg(long)]
    abi: Option<String>,

    /// Search tiers: ':' between tiers, '|' within one
    #[arg(long)]
    search_path: Option<String>,

    /// Sonames never packaged (comma-separated)
    #[arg(long, value_delimiter = ',')]
    exclude: Option<Vec<String>>,

    /// Byte offset of the filesystem inside a raw image
    #[arg(long)]
    offset: Option<u64>,

    /// Worker threads
    #[arg(short, long)]
    jobs: Option<usize>,
}

impl SourceArgs {
    fn split(self, config: &Config) -> (Config, Option<PathBuf>, Target) {
        let target = match (self.exe, self.image_exe) {
            (Some(exe), _) => Target::HostExe(exe),
            (None, Some(path)) => Target::ImageExe(path),
            (None, None) => Target::Libs(self.lib),
        };
        let overrides = Overrides {
            abi: self.abi,
            search_path: self.search_path,
            exclude: self.exclude,
            offset: self.offset,
            sdk: self.sdk,
            api: self.api,
            rev: self.rev,
            jobs: self.jobs,
        };
        (overrides.apply(config), self.image, target)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let base_dir = std::env::current_dir()?;
    let config = Config::load(&base_dir);

    match cli.command {
        Commands::Package { source, output } => {
            let (config, image, target) = source.split(&config);
            commands::cmd_package(&config, image.as_deref(), target, output)?;
        }

        Commands::Deps { source } => {
            let (config, image, target) = source.split(&config);
            commands::cmd_deps(&config, image.as_deref(), target)?;
        }

        Commands::Inspect { file, abi, json } => {
            let config = Overrides {
                abi,
                ..Default::default()
            }
            .apply(&config);
            commands::cmd_inspect(&config, &file, json)?;
        }

        Commands::Show { what } => {
            let show_target = match what {
                ShowTarget::Config => commands::show::ShowTarget::Config,
                ShowTarget::Package { dir } => commands::show::ShowTarget::Package(dir),
            };
            commands::cmd_show(show_target, &config)?;
        }

        Commands::Preflight { strict } => {
            commands::cmd_preflight(&config, strict)?;
        }
    }

    Ok(())
}
