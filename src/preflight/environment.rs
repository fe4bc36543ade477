//! Configuration and work directory checks.

use std::fs;

use crate::config::Config;

use super::types::CheckResult;

pub fn check_environment(config: &Config) -> Vec<CheckResult> {
    let mut results = Vec::new();

    match config.target() {
        Ok(target) => {
            results.push(CheckResult::pass_with("ABI", &format!("{} ({})", config.abi, target)));
            let tiers = config.search_policy(target.class).tiers;
            if tiers.is_empty() {
                results.push(CheckResult::fail(
                    "search path",
                    "LAUNCHER_SEARCH_PATH has no directories",
                ));
            } else {
                results.push(CheckResult::pass_with(
                    "search path",
                    &format!("{} tier(s)", tiers.len()),
                ));
            }
        }
        Err(e) => results.push(CheckResult::fail("ABI", &format!("{:#}", e))),
    }

    if let Some(sdk) = &config.sdk_root {
        if sdk.join("system-images").is_dir() {
            results.push(CheckResult::pass_with("Android SDK", &sdk.display().to_string()));
        } else {
            results.push(CheckResult::warn(
                "Android SDK",
                &format!(
                    "{} has no system-images; --api will download instead",
                    sdk.display()
                ),
            ));
        }
    }

    // Mount points and APEX payloads are created under the work dir
    let work_dir = &config.work_dir;
    let marker = work_dir.join(".preflight-test");
    let writable = fs::create_dir_all(work_dir).and_then(|_| fs::write(&marker, "test"));
    match writable {
        Ok(()) => {
            let _ = fs::remove_file(&marker);
            results.push(CheckResult::pass_with(
                "work dir writable",
                &work_dir.display().to_string(),
            ));
        }
        Err(e) => results.push(CheckResult::fail(
            "work dir writable",
            &format!("Cannot write to {}: {}", work_dir.display(), e),
        )),
    }

    results
}
