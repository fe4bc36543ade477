//! Package command - builds a launcher package.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use android_exe_launcher::assemble::{self, AssembleOptions};
use android_exe_launcher::config::Config;
use android_exe_launcher::layout::{self, ResolvedPackage};
use android_exe_launcher::timing::Timer;

use super::target::{resolve_target, Target};

/// Execute the package command.
pub fn cmd_package(
    config: &Config,
    image_path: Option<&Path>,
    target: Target,
    output: Option<PathBuf>,
) -> Result<()> {
    println!("=== Launcher Package ===\n");
    let resolved = resolve_target(config, image_path, &target)?;
    let graph = &resolved.graph;

    let output = output.unwrap_or_else(|| PathBuf::from(format!("{}.launcher", graph.root())));

    let timer = Timer::start("Plan layout");
    let package = ResolvedPackage::from_graph(graph, &resolved.policy.exclude)
        .context("Resolved libraries do not form a complete package")?;
    let plans = layout::plan_package(&package, graph, config.jobs)
        .context("Cannot rewrite embedded search paths")?;
    let patched = plans.values().filter(|plan| !plan.is_empty()).count();
    timer.finish();

    let timer = Timer::start("Assemble package");
    let options = AssembleOptions {
        output: output.clone(),
        abi: config.abi.clone(),
        image: resolved.handle.source().display().to_string(),
        jobs: config.jobs,
    };
    let manifest = assemble::assemble(resolved.handle.reader(), &package, &plans, &options)
        .with_context(|| format!("Failed to assemble {}", output.display()))?;
    timer.finish();

    println!();
    println!("Package written to {}", output.display());
    println!(
        "  {} libraries ({} patched), interpreter: {}",
        manifest.libraries.len(),
        patched,
        manifest
            .interpreter
            .as_ref()
            .map(|i| i.file.as_str())
            .unwrap_or("none")
    );
    if !graph.excluded().is_empty() {
        let excluded: Vec<&str> = graph.excluded().iter().map(String::as_str).collect();
        println!("  excluded: {}", excluded.join(", "));
    }

    if let Target::HostExe(exe) = &target {
        println!("\nRun with:");
        println!(
            "  {} -L {} -E LD_LIBRARY_PATH={}/{} {}",
            emulator_for(&config.abi),
            output.display(),
            output.display(),
            manifest.lib_dir,
            exe.display()
        );
    }

    Ok(())
}

/// qemu user-mode binary for an Android ABI.
fn emulator_for(abi: &str) -> &'static str {
    match abi {
        "armeabi-v7a" => "qemu-arm",
        "x86_64" => "qemu-x86_64",
        "x86" => "qemu-i386",
        _ => "qemu-aarch64",
    }
}
