//! Host tool availability checks.

use crate::process;

use super::types::CheckResult;

/// (tool, package, purpose)
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("sudo", "sudo", "Runs mount/umount for raw images"),
    ("mount", "util-linux", "Loop-mounts raw system images"),
    ("umount", "util-linux", "Releases loop mounts"),
    ("unzip", "unzip", "Opens .apex/.capex archives and SDK image packages"),
    ("debugfs", "e2fsprogs", "Extracts APEX payload images"),
];

const OPTIONAL_TOOLS: &[(&str, &str, &str)] = &[
    ("curl", "curl", "Downloads SDK system images (only for --api without an SDK install)"),
    (
        "qemu-aarch64",
        "qemu-user",
        "Runs packaged arm64 executables (never invoked by this tool)",
    ),
];

/// Check host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    let required = REQUIRED_TOOLS.iter().map(|tool| (tool, true));
    let optional = OPTIONAL_TOOLS.iter().map(|tool| (tool, false));

    required
        .chain(optional)
        .map(|(&(tool, package, purpose), required)| {
            check_tool_exists(tool, package, purpose, required)
        })
        .collect()
}

/// Check if a tool exists in PATH.
fn check_tool_exists(tool: &str, package: &str, purpose: &str, required: bool) -> CheckResult {
    match process::which(tool) {
        Some(path) => CheckResult::pass_with(tool, &path),
        None => {
            let msg = format!("Not found. Install '{}' package. {}", package, purpose);
            CheckResult::missing(tool, &msg, required)
        }
    }
}
