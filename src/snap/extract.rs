use crate::error::SplitError;
use crate::snap::media::MediaEntry;
use crate::snap::progress;
use crate::snap::records::{CHAT_HISTORY_FILE, FRIENDS_FILE, SNAP_HISTORY_FILE};
use crate::snap::timestamp::{self, TimeSource};
use crate::snap::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::SystemTime;
use tracing::{debug, info};

pub const JSON_DIR: &str = "json";
pub const MEDIA_DIR: &str = "chat_media";

const TARGET_JSON: [&str; 3] = [CHAT_HISTORY_FILE, SNAP_HISTORY_FILE, FRIENDS_FILE];

static CONTINUATION_ARCHIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-(\d+)\.zip$").expect("continuation pattern is valid"));

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TimeSourceCounts {
    pub extended: usize,
    pub legacy: usize,
    pub unknown: usize,
    pub malformed_extra: usize,
}

impl TimeSourceCounts {
    fn record(&mut self, resolved: &timestamp::ResolvedInstant) {
        match resolved.source {
            TimeSource::ExtendedField => self.extended += 1,
            TimeSource::Legacy => self.legacy += 1,
            TimeSource::Unknown => self.unknown += 1,
        }
        if resolved.malformed_extra {
            self.malformed_extra += 1;
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractOutcome {
    pub json_dir: PathBuf,
    pub archives: Vec<PathBuf>,
    pub json_files: usize,
    pub skipped_entries: usize,
    /// Extracted media, sorted by file name.
    pub media: Vec<MediaEntry>,
    pub time_sources: TimeSourceCounts,
}

/// Primary archives first (name order), then `-<n>.zip` continuations by `n`.
pub fn order_archives(input_dir: &Path) -> Result<Vec<PathBuf>> {
    if !input_dir.is_dir() {
        return Err(SplitError::NoArchives(input_dir.display().to_string()).into());
    }
    let mut zips = Vec::new();
    for entry in fs::read_dir(input_dir)
        .with_context(|| format!("failed to read {}", input_dir.display()))?
    {
        let path = entry?.path();
        let is_zip = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("zip"));
        if path.is_file() && is_zip {
            zips.push(path);
        }
    }
    if zips.is_empty() {
        return Err(SplitError::NoArchives(input_dir.display().to_string()).into());
    }
    zips.sort();

    let mut primary = Vec::new();
    let mut continuations = Vec::new();
    for path in zips {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        match CONTINUATION_ARCHIVE
            .captures(name)
            .and_then(|caps| caps[1].parse::<u64>().ok())
        {
            Some(n) => continuations.push((n, path)),
            None => primary.push(path),
        }
    }
    continuations.sort();
    primary.extend(continuations.into_iter().map(|(_, path)| path));
    Ok(primary)
}

/// Where an archive entry lands inside the work dir, if it is wanted at all.
fn destination(enclosed: &Path, work_dir: &Path) -> Option<PathBuf> {
    let parts: Vec<&str> = enclosed
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect();
    let (file_name, parents) = parts.split_last()?;

    if parents.last() == Some(&JSON_DIR) && TARGET_JSON.contains(file_name) {
        return Some(work_dir.join(JSON_DIR).join(file_name));
    }
    let idx = parts.iter().position(|p| *p == MEDIA_DIR)?;
    if idx + 1 >= parts.len() {
        return None;
    }
    Some(parts[idx..].iter().fold(work_dir.to_path_buf(), |acc, p| acc.join(p)))
}

fn write_entry(reader: &mut impl io::Read, dest: &Path, modified: SystemTime) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut out =
        File::create(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    io::copy(reader, &mut out).with_context(|| format!("failed to write {}", dest.display()))?;
    out.set_modified(modified)
        .with_context(|| format!("failed to set mtime on {}", dest.display()))?;
    Ok(())
}

pub fn extract_archives(archives: &[PathBuf], work_dir: &Path) -> Result<ExtractOutcome> {
    let media_dir = work_dir.join(MEDIA_DIR);
    let mut outcome = ExtractOutcome {
        json_dir: work_dir.join(JSON_DIR),
        archives: archives.to_vec(),
        ..ExtractOutcome::default()
    };
    let mut media_slots: HashMap<PathBuf, usize> = HashMap::new();

    for archive_path in archives {
        let file = File::open(archive_path)
            .map_err(|err| SplitError::UnreadableArchive(format!("{}: {err}", archive_path.display())))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|err| SplitError::UnreadableArchive(format!("{}: {err}", archive_path.display())))?;

        let label = archive_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("archive")
            .to_string();
        let bar = progress::bar(archive.len() as u64, &format!("Extracting {label}"));
        info!(archive = %archive_path.display(), entries = archive.len(), "extracting archive");

        for i in 0..archive.len() {
            bar.inc(1);
            let mut entry = match archive.by_index(i) {
                Ok(entry) => entry,
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "ARCHIVE_ENTRY_UNREADABLE",
                        stage: "extract",
                        item: &format!("{label}#{i}"),
                        reason: "entry-skipped",
                        err: &err.to_string(),
                    });
                    outcome.skipped_entries += 1;
                    continue;
                }
            };
            if entry.is_dir() {
                continue;
            }
            let Some(enclosed) = entry.enclosed_name() else {
                outcome.skipped_entries += 1;
                continue;
            };
            let Some(dest) = destination(&enclosed, work_dir) else {
                continue;
            };

            let extra = entry.extra_data().map(<[u8]>::to_vec).unwrap_or_default();
            let legacy = entry.last_modified().and_then(timestamp::legacy_from_zip);
            let resolved = timestamp::resolve(&extra, legacy);
            outcome.time_sources.record(&resolved);
            if resolved.source == TimeSource::Unknown {
                warn::emit(WarnEvent {
                    code: "ENTRY_TIME_UNKNOWN",
                    stage: "extract",
                    item: entry.name(),
                    reason: "no-extended-or-legacy-timestamp",
                    err: "",
                });
            }

            if let Err(err) = write_entry(&mut entry, &dest, SystemTime::from(resolved.instant)) {
                warn::emit(WarnEvent {
                    code: "ENTRY_WRITE_FAILED",
                    stage: "extract",
                    item: &dest.display().to_string(),
                    reason: "entry-skipped",
                    err: &format!("{err:#}"),
                });
                outcome.skipped_entries += 1;
                continue;
            }
            debug!(dest = %dest.display(), source = resolved.source.label(), "extracted entry");

            if dest.starts_with(&media_dir) {
                let file_name = dest
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default()
                    .to_string();
                let media = MediaEntry {
                    path: dest.clone(),
                    file_name,
                    instant: resolved.instant,
                };
                // a later archive carrying the same path replaces the earlier copy
                match media_slots.get(&dest) {
                    Some(&idx) => outcome.media[idx] = media,
                    None => {
                        media_slots.insert(dest, outcome.media.len());
                        outcome.media.push(media);
                    }
                }
            } else {
                outcome.json_files += 1;
            }
        }
        bar.finish_and_clear();
    }

    outcome
        .media
        .sort_by(|a, b| a.file_name.cmp(&b.file_name).then_with(|| a.path.cmp(&b.path)));
    Ok(outcome)
}
