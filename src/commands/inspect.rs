//! Inspect command - prints what the ELF introspector sees in one file.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use android_exe_launcher::config::Config;
use android_exe_launcher::elf::{self, SearchPathKind};

/// Execute the inspect command.
pub fn cmd_inspect(config: &Config, file: &Path, json: bool) -> Result<()> {
    let target = config.target()?;
    let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let object = elf::parse(&file.display().to_string(), &bytes, &target)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&object)?);
        return Ok(());
    }

    println!("{}", file.display());
    println!("  target:      {}", object.target_description());
    println!("  soname:      {}", object.soname.as_deref().unwrap_or("-"));
    println!(
        "  interpreter: {}",
        object.interpreter.as_deref().unwrap_or("-")
    );
    for needed in &object.needed {
        println!("  NEEDED       {}", needed);
    }
    for sp in &object.search_paths {
        let tag = match sp.kind {
            SearchPathKind::RPath => "RPATH ",
            SearchPathKind::RunPath => "RUNPATH",
        };
        println!("  {}      {} (at {:#x})", tag, sp.value, sp.offset);
    }
    if let Some(table) = &object.string_table {
        println!(
            "  strtab:      {:#x} ({} bytes)",
            table.offset, table.size
        );
    }

    Ok(())
}
