//! Deps command - prints the resolved dependency graph.

use anyhow::Result;
use std::path::Path;

use android_exe_launcher::config::Config;

use super::target::{resolve_target, Target};

/// Execute the deps command.
pub fn cmd_deps(config: &Config, image_path: Option<&Path>, target: Target) -> Result<()> {
    let resolved = resolve_target(config, image_path, &target)?;
    let graph = &resolved.graph;

    println!();
    println!(
        "Image: {} ({})",
        resolved.handle.source().display(),
        if resolved.handle.is_mounted() {
            "loop-mounted"
        } else {
            "directory"
        }
    );
    println!(
        "{} ({} libraries, {} edges, {})",
        graph.root(),
        graph.len(),
        graph.edges().count(),
        resolved.target
    );

    if let Some(interp) = graph.interpreter() {
        println!("  interpreter {} => {}", interp.soname, interp.path);
    }

    for node in graph.nodes() {
        println!("  {} => {}", node.soname, node.path);
        println!("      requested by: {}", graph.requesters(&node.soname).join(", "));
        if !node.needed().is_empty() {
            println!("      needs: {}", node.needed().join(", "));
        }
    }

    if !graph.excluded().is_empty() {
        println!("\nExcluded (provided by the loader):");
        for soname in graph.excluded() {
            println!("  {} (requested by {})", soname, graph.requesters(soname).join(", "));
        }
    }

    Ok(())
}
