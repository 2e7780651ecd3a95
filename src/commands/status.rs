use anyhow::Result;
use std::env;

use crate::commands::CommandReport;
use crate::snap::config::{load_config, resolve_config_path};
use crate::snap::extract::order_archives;
use crate::snap::lock::read_payload;
use crate::snap::paths::{PathOverrides, resolve_paths};

include!(concat!(env!("OUT_DIR"), "/snapsplit_env_allowlist.rs"));

fn unknown_env_keys(keys: impl Iterator<Item = String>) -> Vec<String> {
    let mut unknown: Vec<String> = keys
        .filter(|k| k.starts_with("SNAPSPLIT_"))
        .filter(|k| !GENERATED_SNAPSPLIT_ENV_ALLOWLIST.contains(&k.as_str()))
        .collect();
    unknown.sort();
    unknown
}

pub fn run() -> Result<CommandReport> {
    let paths = resolve_paths(&PathOverrides::default());
    let mut report = CommandReport::new("status");

    report.detail(format!("build_uuid={}", env!("BUILD_UUID")));
    report.detail(format!("input_dir={}", paths.input_dir.display()));
    report.detail(format!("work_dir={}", paths.work_dir.display()));
    report.detail(format!("output_dir={}", paths.output_dir.display()));
    match resolve_config_path() {
        Some(path) if path.exists() => report.detail(format!("config_path={}", path.display())),
        Some(path) => report.detail(format!("config_path={} (not found, defaults)", path.display())),
        None => report.detail("config_path=none (defaults)"),
    }

    match load_config() {
        Ok(cfg) => {
            report.detail(format!(
                "matching.threshold_secs={} matching.overlay_penalty_secs={}",
                cfg.matching.threshold_secs, cfg.matching.overlay_penalty_secs
            ));
            report.detail(format!(
                "avatars.fetch_enabled={} avatars.max_workers={} avatars.timeout_secs={} avatars.retry_total={}",
                cfg.avatars.fetch_enabled,
                cfg.avatars.max_workers,
                cfg.avatars.timeout_secs,
                cfg.avatars.retry_total
            ));
            report.detail(format!(
                "output.copy_orphans={} output.keep_work_dir={}",
                cfg.output.copy_orphans, cfg.output.keep_work_dir
            ));
        }
        Err(err) => report.issue(format!("config invalid: {err:#}")),
    }

    match order_archives(&paths.input_dir) {
        Ok(archives) => {
            report.detail(format!("archives={}", archives.len()));
            for archive in archives {
                report.detail(format!("archive={}", archive.display()));
            }
        }
        Err(err) => report.issue(format!("{err:#}")),
    }

    let lock_path = paths.lock_file();
    if lock_path.exists() {
        match read_payload(&lock_path) {
            Some(payload) => {
                report.detail(format!(
                    "lock=held pid={} start_time={}",
                    payload.pid, payload.start_time
                ));
                if payload.build_uuid != env!("BUILD_UUID") {
                    report.detail(format!("lock.build_mismatch={}", payload.build_uuid));
                }
            }
            None => report.issue(format!("lock=unreadable ({})", lock_path.display())),
        }
    } else {
        report.detail("lock=free");
    }

    for key in unknown_env_keys(env::vars().map(|(k, _)| k)) {
        report.issue(format!("unknown environment variable {key}"));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_covers_read_variables() {
        for key in ["SNAPSPLIT_LOG", "SNAPSPLIT_OUTPUT_DIR", "SNAPSPLIT_MATCH_THRESHOLD_SECS"] {
            assert!(GENERATED_SNAPSPLIT_ENV_ALLOWLIST.contains(&key), "{key}");
        }
    }

    #[test]
    fn unknown_keys_are_reported_sorted() {
        // built at runtime so the build script does not allowlist them
        let stray = |suffix: &str| format!("SNAPSPLIT_{suffix}");
        let keys = vec![stray("ZZZ"), "PATH".to_string(), "SNAPSPLIT_LOG".to_string(), stray("AAA")];
        assert_eq!(unknown_env_keys(keys.into_iter()), vec![stray("AAA"), stray("ZZZ")]);
    }
}
