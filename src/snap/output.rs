//! On-disk layout of a split run.
//!
//! ```text
//! <out>/days/<date>/<conversation>.json
//! <out>/days/<date>/media/<file>
//! <out>/days/<date>/orphaned/<file>
//! <out>/days/<date>/summary.json
//! <out>/index.json
//! ```

use crate::snap::correlate::MatchSource;
use crate::snap::days::{DayBucket, GroupInfo, IndexedExport};
use crate::snap::media::MediaFile;
use crate::snap::progress;
use crate::snap::records::{MessageRecord, RecordKind};
use crate::snap::util::{sanitize_filename, write_json};
use crate::snap::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

pub const DAYS_DIR: &str = "days";
pub const DAY_MEDIA_DIR: &str = "media";
pub const ORPHAN_DIR: &str = "orphaned";
pub const SUMMARY_FILE: &str = "summary.json";
pub const INDEX_FILE: &str = "index.json";

pub fn media_type_for(extension: &str) -> &'static str {
    match extension.trim_start_matches('.').to_ascii_lowercase().as_str() {
        "mp4" | "mov" | "avi" | "webm" => "VIDEO",
        "mp3" | "aac" | "m4a" | "wav" | "ogg" => "AUDIO",
        _ => "IMAGE",
    }
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_string()
}

/// A message as written to a conversation document: the export fields,
/// anything unrecognised, the record kind and where its media landed.
#[derive(Debug, Serialize)]
struct OutputMessage<'a> {
    #[serde(rename = "From")]
    from: Option<&'a str>,
    #[serde(rename = "Media Type")]
    media_type: Option<&'a str>,
    #[serde(rename = "Created")]
    created: &'a str,
    #[serde(rename = "Created(microseconds)")]
    created_millis: i64,
    #[serde(rename = "Content", skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(rename = "Conversation Title")]
    conversation_title: Option<&'a str>,
    #[serde(rename = "IsSender")]
    is_sender: bool,
    #[serde(rename = "IsSaved")]
    is_saved: bool,
    #[serde(rename = "Media IDs", skip_serializing_if = "Option::is_none")]
    media_ids: Option<String>,
    #[serde(flatten)]
    extra: &'a Map<String, Value>,
    #[serde(rename = "Type")]
    kind: &'static str,
    media_locations: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    media_matches: Vec<MatchNote<'a>>,
}

/// How one of the message's files was bound.
#[derive(Debug, Serialize)]
struct MatchNote<'a> {
    file: &'a str,
    source: MatchSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    delta_ms: Option<i64>,
}

impl<'a> OutputMessage<'a> {
    fn new(record: &'a MessageRecord, media_locations: Option<Vec<String>>) -> Self {
        Self {
            from: record.sender.as_deref(),
            media_type: record.media_type.as_deref(),
            created: &record.created,
            created_millis: record.timestamp_millis(),
            content: record.content.as_deref(),
            conversation_title: record.conversation_title.as_deref(),
            is_sender: record.is_sender,
            is_saved: record.is_saved,
            media_ids: (record.kind == RecordKind::Message && !record.media_ids.is_empty())
                .then(|| record.media_ids.join("|")),
            extra: &record.extra,
            kind: record.kind.as_str(),
            media_locations,
            media_matches: record
                .matched_media
                .iter()
                .map(|m| MatchNote {
                    file: &m.file.file_name,
                    source: m.source,
                    delta_ms: m.delta_millis,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ConversationDocument<'a> {
    date: String,
    conversation_id: &'a str,
    conversation_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    group_name: Option<String>,
    messages: Vec<OutputMessage<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DayStats {
    conversation_count: usize,
    message_count: usize,
    media_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanEntry {
    pub path: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub media_type: &'static str,
    pub extension: String,
}

#[derive(Debug, Serialize)]
struct OrphanedMedia {
    orphaned_media_count: usize,
    orphaned_media: Vec<OrphanEntry>,
}

#[derive(Debug, Serialize)]
struct ConversationRef {
    conversation_id: String,
    file: String,
}

#[derive(Debug, Serialize)]
struct DaySummary {
    date: String,
    stats: DayStats,
    conversations: Vec<ConversationRef>,
    #[serde(rename = "orphanedMedia")]
    orphaned_media: OrphanedMedia,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputStats {
    pub days: usize,
    pub conversation_files: usize,
    pub media_copied: usize,
    pub media_missing: usize,
    pub orphaned: usize,
    pub orphans_copied: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserEntry {
    pub username: String,
    pub display_name: String,
    pub bitmoji: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDocument {
    pub account_owner: String,
    pub users: Vec<UserEntry>,
    pub groups: Vec<GroupInfo>,
}

fn short_hash(value: &str) -> String {
    Sha256::digest(value.as_bytes())
        .iter()
        .take(3)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Document file name for a conversation, unique within one day folder.
fn conversation_file_name(conversation_id: &str, used: &mut HashSet<String>) -> String {
    let base = sanitize_filename(conversation_id);
    let mut stem = base.clone();
    if used.contains(&stem) {
        stem = format!("{base}-{}", short_hash(conversation_id));
    }
    if stem == SUMMARY_FILE.trim_end_matches(".json") {
        stem = format!("{stem}-{}", short_hash(conversation_id));
    }
    used.insert(stem.clone());
    format!("{stem}.json")
}

/// Copy keeping the resolved instant as the destination mtime.
fn copy_with_mtime(src: &Path, dest: &Path, modified: SystemTime) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::copy(src, dest)
        .with_context(|| format!("failed to copy {} -> {}", src.display(), dest.display()))?;
    let file = File::options()
        .write(true)
        .open(dest)
        .with_context(|| format!("failed to reopen {}", dest.display()))?;
    file.set_modified(modified)
        .with_context(|| format!("failed to set mtime on {}", dest.display()))?;
    Ok(())
}

pub struct OutputWriter<'a> {
    root: &'a Path,
    copy_orphans: bool,
}

impl<'a> OutputWriter<'a> {
    pub fn new(root: &'a Path, copy_orphans: bool) -> Self {
        Self { root, copy_orphans }
    }

    pub fn days_dir(&self) -> PathBuf {
        self.root.join(DAYS_DIR)
    }

    /// Replace `<out>/days` with one folder per message or orphan date.
    pub fn write_days(&self, export: &IndexedExport, residual: &[Arc<MediaFile>]) -> Result<OutputStats> {
        let days_dir = self.days_dir();
        if days_dir.exists() {
            fs::remove_dir_all(&days_dir)
                .with_context(|| format!("failed to clear {}", days_dir.display()))?;
        }

        let mut orphans_by_day: BTreeMap<NaiveDate, Vec<&MediaFile>> = BTreeMap::new();
        for file in residual {
            orphans_by_day
                .entry(file.instant.date_naive())
                .or_default()
                .push(file.as_ref());
        }

        let dates: BTreeSet<NaiveDate> = export
            .days
            .iter()
            .map(|(date, _)| *date)
            .chain(orphans_by_day.keys().copied())
            .collect();

        let mut stats = OutputStats::default();
        let bar = progress::bar(dates.len() as u64, "Writing output");
        for date in dates {
            let orphans = orphans_by_day.get(&date).map(Vec::as_slice).unwrap_or_default();
            self.write_day(date, export.days.get(date), export, orphans, &mut stats)?;
            bar.inc(1);
        }
        bar.finish_and_clear();

        info!(
            days = stats.days,
            conversations = stats.conversation_files,
            media_copied = stats.media_copied,
            orphaned = stats.orphaned,
            "wrote day folders"
        );
        Ok(stats)
    }

    fn copy_message_media(
        &self,
        record: &MessageRecord,
        media_dir: &Path,
        copied: &mut BTreeSet<String>,
        stats: &mut OutputStats,
    ) -> Option<Vec<String>> {
        let mut locations = Vec::new();
        for matched in &record.matched_media {
            let file = &matched.file;
            let rel = format!("{DAY_MEDIA_DIR}/{}", file.file_name);
            if copied.contains(&file.file_name) {
                locations.push(rel);
                continue;
            }
            let dest = media_dir.join(&file.file_name);
            match copy_with_mtime(&file.path, &dest, SystemTime::from(file.instant)) {
                Ok(()) => {
                    copied.insert(file.file_name.clone());
                    stats.media_copied += 1;
                    locations.push(rel);
                }
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "MEDIA_COPY_FAILED",
                        stage: "output",
                        item: &file.file_name,
                        reason: "location-omitted",
                        err: &format!("{err:#}"),
                    });
                    stats.media_missing += 1;
                }
            }
        }
        (!locations.is_empty()).then_some(locations)
    }

    fn collect_orphans(&self, folder: &Path, orphans: &[&MediaFile], stats: &mut OutputStats) -> Vec<OrphanEntry> {
        let mut entries = Vec::with_capacity(orphans.len());
        for file in orphans {
            if self.copy_orphans {
                let dest = folder.join(ORPHAN_DIR).join(&file.file_name);
                match copy_with_mtime(&file.path, &dest, SystemTime::from(file.instant)) {
                    Ok(()) => stats.orphans_copied += 1,
                    Err(err) => warn::emit(WarnEvent {
                        code: "ORPHAN_COPY_FAILED",
                        stage: "output",
                        item: &file.file_name,
                        reason: "reported-not-copied",
                        err: &format!("{err:#}"),
                    }),
                }
            }
            let extension = extension_of(&file.file_name);
            entries.push(OrphanEntry {
                path: format!("{ORPHAN_DIR}/{}", file.file_name),
                filename: file.file_name.clone(),
                media_type: media_type_for(&extension),
                extension,
            });
        }
        stats.orphaned += entries.len();
        entries
    }

    fn write_day(
        &self,
        date: NaiveDate,
        bucket: Option<&DayBucket>,
        export: &IndexedExport,
        orphans: &[&MediaFile],
        stats: &mut OutputStats,
    ) -> Result<()> {
        let date_str = date.format("%Y-%m-%d").to_string();
        let folder = self.days_dir().join(&date_str);
        fs::create_dir_all(&folder).with_context(|| format!("failed to create {}", folder.display()))?;
        let media_dir = folder.join(DAY_MEDIA_DIR);

        let mut copied = BTreeSet::new();
        let mut used_names = HashSet::new();
        let mut refs = Vec::new();
        let mut message_count = 0usize;

        for conv in bucket.map(DayBucket::conversations).unwrap_or_default() {
            let group = conv.is_group();
            let messages: Vec<OutputMessage<'_>> = conv
                .messages
                .iter()
                .map(|record| {
                    let locations = self.copy_message_media(record, &media_dir, &mut copied, stats);
                    OutputMessage::new(record, locations)
                })
                .collect();
            message_count += messages.len();

            let doc = ConversationDocument {
                date: date_str.clone(),
                conversation_id: &conv.id,
                conversation_type: if group { "group" } else { "individual" },
                group_name: group.then(|| export.group_name(&conv.id)),
                messages,
            };
            let file_name = conversation_file_name(&conv.id, &mut used_names);
            write_json(&folder.join(&file_name), &doc)?;
            debug!(date = %date_str, conversation = %conv.id, file = %file_name, "wrote conversation");
            stats.conversation_files += 1;
            refs.push(ConversationRef {
                conversation_id: conv.id.clone(),
                file: file_name,
            });
        }

        let orphaned = self.collect_orphans(&folder, orphans, stats);
        let summary = DaySummary {
            date: date_str,
            stats: DayStats {
                conversation_count: refs.len(),
                message_count,
                media_count: copied.len(),
            },
            conversations: refs,
            orphaned_media: OrphanedMedia {
                orphaned_media_count: orphaned.len(),
                orphaned_media: orphaned,
            },
        };
        write_json(&folder.join(SUMMARY_FILE), &summary)?;
        stats.days += 1;
        Ok(())
    }
}

/// Users sorted by username; display names fall back to the username.
pub fn build_index(
    owner: &str,
    usernames: &BTreeSet<String>,
    display_names: &BTreeMap<String, String>,
    avatar_paths: &BTreeMap<String, String>,
    groups: &[GroupInfo],
) -> IndexDocument {
    let users = usernames
        .iter()
        .filter(|u| !u.is_empty())
        .map(|username| UserEntry {
            username: username.clone(),
            display_name: display_names
                .get(username)
                .filter(|d| !d.is_empty())
                .cloned()
                .unwrap_or_else(|| username.clone()),
            bitmoji: avatar_paths.get(username).cloned(),
        })
        .collect();
    IndexDocument {
        account_owner: owner.to_string(),
        users,
        groups: groups.to_vec(),
    }
}

pub fn write_index(root: &Path, index: &IndexDocument) -> Result<PathBuf> {
    let path = root.join(INDEX_FILE);
    write_json(&path, index)?;
    info!(path = %path.display(), users = index.users.len(), groups = index.groups.len(), "wrote index");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snap::correlate::MatchedMedia;
    use crate::snap::days::tests::record;
    use crate::snap::media::MediaClass;
    use chrono::{DateTime, Utc};

    fn media_file(dir: &Path, name: &str, at: &str) -> Arc<MediaFile> {
        let path = dir.join(name);
        fs::write(&path, name.as_bytes()).expect("write media");
        Arc::new(MediaFile {
            file_name: name.to_string(),
            path,
            instant: ts(at),
            class: MediaClass::Other,
            media_id: None,
        })
    }

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().expect("instant")
    }

    fn read_json(path: &Path) -> Value {
        serde_json::from_str(&fs::read_to_string(path).expect("read")).expect("json")
    }

    fn team_has_no_matches(day: &Path) -> bool {
        read_json(&day.join("team-1.json"))["messages"][0]
            .get("media_matches")
            .is_none()
    }

    #[test]
    fn media_types_follow_extensions() {
        assert_eq!(media_type_for("MP4"), "VIDEO");
        assert_eq!(media_type_for(".ogg"), "AUDIO");
        assert_eq!(media_type_for("jpeg"), "IMAGE");
        assert_eq!(media_type_for("bin"), "IMAGE");
    }

    #[test]
    fn conversation_names_stay_unique_per_day() {
        let mut used = HashSet::new();
        assert_eq!(conversation_file_name("a/b", &mut used), "a_b.json");
        let second = conversation_file_name("a b", &mut used);
        assert_ne!(second, "a_b.json");
        assert!(second.starts_with("a_b-"));
        assert_ne!(conversation_file_name("summary", &mut used), "summary.json");
    }

    #[test]
    fn day_folders_carry_documents_media_and_orphans() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src = tmp.path().join("src");
        fs::create_dir_all(&src).expect("src dir");
        let out = tmp.path().join("out");

        let bound = media_file(&src, "2024-01-05_b~A.jpg", "2024-01-05T10:00:00Z");
        let orphan = media_file(&src, "2024-01-05_media~X.mp4", "2024-01-05T11:00:00Z");
        let lonely = media_file(&src, "2024-01-07_media~Y.png", "2024-01-07T11:00:00Z");

        let mut with_media = record("amy", "amy", ts("2024-01-05T10:00:00Z"));
        with_media.matched_media.push(MatchedMedia {
            file: bound.clone(),
            source: MatchSource::Identifier,
            delta_millis: None,
        });
        let plain = record("team-1", "bob", ts("2024-01-05T10:05:00Z"));

        let mut export = IndexedExport::default();
        export.days.insert(with_media);
        export.days.insert(plain);
        export.group_titles.insert("team-1".to_string(), "Team".to_string());

        let writer = OutputWriter::new(&out, true);
        let stats = writer
            .write_days(&export, &[orphan.clone(), lonely.clone()])
            .expect("write days");

        assert_eq!(stats.days, 2);
        assert_eq!(stats.conversation_files, 2);
        assert_eq!(stats.media_copied, 1);
        assert_eq!(stats.orphaned, 2);

        let day = out.join("days/2024-01-05");
        assert!(day.join("media/2024-01-05_b~A.jpg").is_file());
        assert!(day.join("orphaned/2024-01-05_media~X.mp4").is_file());

        let amy = read_json(&day.join("amy.json"));
        assert_eq!(amy["conversation_type"], "individual");
        assert_eq!(amy["messages"][0]["media_locations"][0], "media/2024-01-05_b~A.jpg");
        assert_eq!(amy["messages"][0]["Type"], "message");
        assert_eq!(amy["messages"][0]["media_matches"][0]["source"], "identifier");
        assert!(team_has_no_matches(&day));

        let team = read_json(&day.join("team-1.json"));
        assert_eq!(team["group_name"], "Team");
        assert!(team["messages"][0]["media_locations"].is_null());

        let summary = read_json(&day.join(SUMMARY_FILE));
        assert_eq!(summary["stats"]["conversationCount"], 2);
        assert_eq!(summary["stats"]["messageCount"], 2);
        assert_eq!(summary["stats"]["mediaCount"], 1);
        assert_eq!(summary["orphanedMedia"]["orphaned_media"][0]["type"], "VIDEO");

        let orphan_day = read_json(&out.join("days/2024-01-07").join(SUMMARY_FILE));
        assert_eq!(orphan_day["stats"]["messageCount"], 0);
        assert_eq!(orphan_day["orphanedMedia"]["orphaned_media_count"], 1);
    }

    #[test]
    fn index_falls_back_to_username_for_display() {
        let users: BTreeSet<String> = ["amy", "bob", ""].iter().map(|s| s.to_string()).collect();
        let names = BTreeMap::from([("amy".to_string(), "Amy A".to_string())]);
        let avatars = BTreeMap::from([("bob".to_string(), "bitmoji/bob.svg".to_string())]);
        let index = build_index("amy", &users, &names, &avatars, &[]);
        assert_eq!(index.users.len(), 2);
        assert_eq!(index.users[0].display_name, "Amy A");
        assert_eq!(index.users[0].bitmoji, None);
        assert_eq!(index.users[1].display_name, "bob");
        assert_eq!(index.users[1].bitmoji.as_deref(), Some("bitmoji/bob.svg"));
    }
}
