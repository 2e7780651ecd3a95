use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::commands::CommandReport;
use crate::snap::avatar::{AvatarSource, AvatarStats, AvatarSynthesizer, save_avatars};
use crate::snap::config::{AvatarConfig, load_config};
use crate::snap::paths::{PathOverrides, resolve_paths};

/// Synthesize every username and write the SVGs under `dir`.
pub fn synthesize_and_save(
    cfg: &AvatarConfig,
    usernames: &BTreeSet<String>,
    dir: &Path,
) -> Result<(BTreeMap<String, String>, AvatarStats)> {
    let synth = AvatarSynthesizer::new(cfg)?;
    let (avatars, stats) = synth.synthesize_all(usernames)?;
    let saved = save_avatars(&avatars, dir)?;
    Ok((saved, stats))
}

pub fn run(usernames: &[String], output_dir: Option<PathBuf>) -> Result<CommandReport> {
    let cfg = load_config()?;
    let paths = resolve_paths(&PathOverrides {
        output_dir,
        ..PathOverrides::default()
    });
    let mut report = CommandReport::new("avatars");

    let wanted: BTreeSet<String> = usernames
        .iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect();
    if wanted.is_empty() {
        report.issue("no usernames given");
        return Ok(report);
    }

    let synth = AvatarSynthesizer::new(&cfg.avatars)?;
    let (avatars, stats) = synth.synthesize_all(&wanted)?;
    let saved = save_avatars(&avatars, &paths.avatar_dir())?;

    for (username, rel) in &saved {
        let source = match avatars.get(username).map(|a| a.source) {
            Some(AvatarSource::Fetched) => "fetched",
            _ => "fallback",
        };
        report.detail(format!("{username}={rel} ({source})"));
    }
    report.detail(format!("avatars.fetched={}", stats.fetched));
    report.detail(format!("avatars.fallback={}", stats.fallback));
    report.detail(format!("avatars.dir={}", paths.avatar_dir().display()));
    Ok(report)
}
