//! Show command - displays information.

use anyhow::Result;
use std::path::Path;

use android_exe_launcher::assemble;
use android_exe_launcher::config::Config;
use android_exe_launcher::manifest::{Manifest, MANIFEST_FILE};

/// Show target for the show command.
pub enum ShowTarget {
    /// Show configuration
    Config,
    /// Summarize an assembled package
    Package(std::path::PathBuf),
}

/// Execute the show command.
pub fn cmd_show(target: ShowTarget, config: &Config) -> Result<()> {
    match target {
        ShowTarget::Config => config.print(),
        ShowTarget::Package(dir) => show_package(&dir)?,
    }
    Ok(())
}

fn show_package(dir: &Path) -> Result<()> {
    let manifest = Manifest::load(dir.join(MANIFEST_FILE))?;

    println!("Package {} ({})", dir.display(), manifest.abi);
    println!("  built for: {}", manifest.root);
    println!("  image:     {}", manifest.image);
    if let Some(interp) = &manifest.interpreter {
        println!("  interpreter: {} <- {}", interp.file, interp.origin);
    }
    for (soname, entry) in &manifest.libraries {
        let patched = if entry.patched { " [patched]" } else { "" };
        println!("  {} <- {}{}", soname, entry.origin, patched);
    }
    if !manifest.excluded.is_empty() {
        let excluded: Vec<&str> = manifest.excluded.iter().map(String::as_str).collect();
        println!("  excluded: {}", excluded.join(", "));
    }

    match assemble::verify(dir, &manifest) {
        Ok(()) => println!("  contents match the manifest"),
        Err(e) => eprintln!("  [WARN] {:#}", e),
    }
    Ok(())
}
