use crate::error::SplitError;
use crate::snap::correlate::MatchedMedia;
use crate::snap::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub const CHAT_HISTORY_FILE: &str = "chat_history.json";
pub const SNAP_HISTORY_FILE: &str = "snap_history.json";
pub const FRIENDS_FILE: &str = "friends.json";

const UNKNOWN_OWNER: &str = "unknown_user";
const CREATED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Message,
    Snap,
}

impl RecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Snap => "snap",
        }
    }
}

/// One row of `chat_history.json` / `snap_history.json` as exported.
#[derive(Debug, Clone, Deserialize)]
struct RawRecord {
    #[serde(rename = "From", default)]
    from: Option<String>,
    #[serde(rename = "Media Type", default)]
    media_type: Option<String>,
    #[serde(rename = "Created", default)]
    created: Option<String>,
    #[serde(rename = "Created(microseconds)", default)]
    created_millis: Option<i64>,
    #[serde(rename = "Content", default)]
    content: Option<String>,
    #[serde(rename = "Conversation Title", default)]
    conversation_title: Option<String>,
    #[serde(rename = "IsSender", default)]
    is_sender: bool,
    #[serde(rename = "IsSaved", default)]
    is_saved: bool,
    #[serde(rename = "Media IDs", default)]
    media_ids: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub conversation_id: String,
    pub sender: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub created: String,
    pub media_type: Option<String>,
    pub media_ids: Vec<String>,
    pub content: Option<String>,
    pub conversation_title: Option<String>,
    pub is_sender: bool,
    pub is_saved: bool,
    pub kind: RecordKind,
    /// Export fields without a typed counterpart, kept for output.
    pub extra: Map<String, Value>,
    pub matched_media: Vec<MatchedMedia>,
}

impl MessageRecord {
    pub fn date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }

    /// Text-only records never carry an attachment slot.
    pub fn expects_media(&self) -> bool {
        !self
            .media_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("TEXT"))
    }
}

/// All records of one conversation, in export order.
#[derive(Debug, Clone)]
pub struct ConversationRecords {
    pub id: String,
    pub records: Vec<MessageRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct ExportTables {
    pub chats: Vec<ConversationRecords>,
    pub snaps: Vec<ConversationRecords>,
    pub skipped_records: usize,
}

pub fn split_media_ids(raw: &str) -> Vec<String> {
    raw.split('|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn parse_created(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix("UTC").unwrap_or(trimmed).trim();
    NaiveDateTime::parse_from_str(trimmed, CREATED_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

fn record_timestamp(raw: &RawRecord) -> Option<DateTime<Utc>> {
    if let Some(millis) = raw.created_millis {
        if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(millis) {
            return Some(ts);
        }
    }
    raw.created.as_deref().and_then(parse_created)
}

fn into_record(conversation_id: &str, raw: RawRecord, kind: RecordKind) -> Option<MessageRecord> {
    let timestamp = record_timestamp(&raw)?;
    let created = raw
        .created
        .clone()
        .unwrap_or_else(|| timestamp.format("%Y-%m-%d %H:%M:%S UTC").to_string());

    let record = match kind {
        RecordKind::Message => MessageRecord {
            conversation_id: conversation_id.to_string(),
            sender: raw.from,
            timestamp,
            created,
            media_type: raw.media_type,
            media_ids: raw.media_ids.as_deref().map(split_media_ids).unwrap_or_default(),
            content: raw.content,
            conversation_title: raw.conversation_title,
            is_sender: raw.is_sender,
            is_saved: raw.is_saved,
            kind,
            extra: raw.extra,
            matched_media: Vec::new(),
        },
        // Snap rows only carry a fixed subset; the rest is reset to defaults.
        RecordKind::Snap => MessageRecord {
            conversation_id: conversation_id.to_string(),
            sender: raw.from,
            timestamp,
            created,
            media_type: raw.media_type,
            media_ids: Vec::new(),
            content: None,
            conversation_title: raw.conversation_title,
            is_sender: raw.is_sender,
            is_saved: false,
            kind,
            extra: Map::new(),
            matched_media: Vec::new(),
        },
    };
    Some(record)
}

fn parse_table(raw: &str, kind: RecordKind, source: &Path) -> Result<(Vec<ConversationRecords>, usize)> {
    let root: Map<String, Value> = serde_json::from_str(raw)
        .with_context(|| format!("failed to parse {}", source.display()))?;

    let mut out = Vec::with_capacity(root.len());
    let mut skipped = 0usize;
    for (conversation_id, rows) in root {
        let rows: Vec<Value> = match serde_json::from_value(rows) {
            Ok(rows) => rows,
            Err(err) => {
                warn::emit(WarnEvent {
                    code: "CONVERSATION_UNREADABLE",
                    stage: "load",
                    item: &conversation_id,
                    reason: "rows-not-an-array",
                    err: &err.to_string(),
                });
                skipped += 1;
                continue;
            }
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let row: RawRecord = match serde_json::from_value(row) {
                Ok(row) => row,
                Err(err) => {
                    warn::emit(WarnEvent {
                        code: "RECORD_UNREADABLE",
                        stage: "load",
                        item: &conversation_id,
                        reason: "row-not-a-record",
                        err: &err.to_string(),
                    });
                    skipped += 1;
                    continue;
                }
            };
            match into_record(&conversation_id, row, kind) {
                Some(record) => records.push(record),
                None => {
                    warn::emit(WarnEvent {
                        code: "RECORD_TIMESTAMP_INVALID",
                        stage: "load",
                        item: &conversation_id,
                        reason: "no-parsable-created-timestamp",
                        err: "",
                    });
                    skipped += 1;
                }
            }
        }
        out.push(ConversationRecords {
            id: conversation_id,
            records,
        });
    }
    Ok((out, skipped))
}

fn read_required(json_dir: &Path, name: &str) -> Result<String> {
    let path = json_dir.join(name);
    if !path.is_file() {
        return Err(SplitError::MissingTable(path.display().to_string()).into());
    }
    fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
}

pub fn load_tables(json_dir: &Path) -> Result<ExportTables> {
    let chat_raw = read_required(json_dir, CHAT_HISTORY_FILE)?;
    let snap_raw = read_required(json_dir, SNAP_HISTORY_FILE)?;

    let (chats, chat_skipped) =
        parse_table(&chat_raw, RecordKind::Message, &json_dir.join(CHAT_HISTORY_FILE))?;
    let (snaps, snap_skipped) =
        parse_table(&snap_raw, RecordKind::Snap, &json_dir.join(SNAP_HISTORY_FILE))?;

    Ok(ExportTables {
        chats,
        snaps,
        skipped_records: chat_skipped + snap_skipped,
    })
}

/// Username -> display name from `friends.json`. Missing or unreadable
/// files yield an empty map.
pub fn load_display_names(json_dir: &Path) -> BTreeMap<String, String> {
    let path = json_dir.join(FRIENDS_FILE);
    if !path.exists() {
        return BTreeMap::new();
    }
    let parsed = fs::read_to_string(&path)
        .map_err(|err| err.to_string())
        .and_then(|raw| serde_json::from_str::<Value>(&raw).map_err(|err| err.to_string()));
    match parsed {
        Ok(root) => display_names_from(&root),
        Err(err) => {
            warn::emit(WarnEvent {
                code: "FRIENDS_UNREADABLE",
                stage: "load",
                item: FRIENDS_FILE,
                reason: "display-names-unavailable",
                err: &err,
            });
            BTreeMap::new()
        }
    }
}

fn display_names_from(root: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(categories) = root.as_object() else {
        return out;
    };
    for entries in categories.values().filter_map(Value::as_array) {
        for entry in entries {
            let Some(username) = entry.get("Username").and_then(Value::as_str) else {
                continue;
            };
            let display = entry
                .get("Display Name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            out.insert(username.to_string(), display.to_string());
        }
    }
    out
}

/// The account owner is the sender of the first outgoing record.
pub fn find_owner(tables: &ExportTables) -> String {
    tables
        .chats
        .iter()
        .chain(tables.snaps.iter())
        .flat_map(|conv| conv.records.iter())
        .find(|record| record.is_sender)
        .and_then(|record| record.sender.clone())
        .unwrap_or_else(|| UNKNOWN_OWNER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn media_ids_split_on_pipe() {
        assert_eq!(
            split_media_ids("b~AAA | b~BBB|"),
            vec!["b~AAA".to_string(), "b~BBB".to_string()]
        );
        assert!(split_media_ids("  ").is_empty());
    }

    #[test]
    fn created_string_used_when_millis_missing() {
        let raw = json!({"alice": [{"From": "alice", "Created": "2024-01-05 23:59:50 UTC"}]});
        let (convs, skipped) =
            parse_table(&raw.to_string(), RecordKind::Message, Path::new("chat.json")).unwrap();
        assert_eq!(skipped, 0);
        assert_eq!(
            convs[0].records[0].timestamp,
            Utc.with_ymd_and_hms(2024, 1, 5, 23, 59, 50).unwrap()
        );
    }

    #[test]
    fn conversation_order_follows_the_file() {
        let raw = r#"{"zed": [], "alice": [], "mike-group": []}"#;
        let (convs, _) = parse_table(raw, RecordKind::Message, Path::new("chat.json")).unwrap();
        let ids: Vec<_> = convs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["zed", "alice", "mike-group"]);
    }

    #[test]
    fn snap_rows_drop_content_and_media_ids() {
        let raw = json!({"bob": [{
            "From": "bob",
            "Created(microseconds)": 1_704_499_190_000i64,
            "Content": "ignored",
            "Media IDs": "b~X",
            "Extra": 1
        }]});
        let (convs, _) =
            parse_table(&raw.to_string(), RecordKind::Snap, Path::new("snap.json")).unwrap();
        let record = &convs[0].records[0];
        assert!(record.media_ids.is_empty());
        assert!(record.content.is_none());
        assert!(record.extra.is_empty());
        assert_eq!(record.kind, RecordKind::Snap);
    }

    #[test]
    fn unparsable_timestamp_is_skipped_not_fatal() {
        let raw = json!({"bob": [{"From": "bob", "Created": "yesterday"}]});
        let (convs, skipped) =
            parse_table(&raw.to_string(), RecordKind::Message, Path::new("chat.json")).unwrap();
        assert_eq!(skipped, 1);
        assert!(convs[0].records.is_empty());
    }

    #[test]
    fn malformed_row_is_skipped_and_siblings_kept() {
        let raw = json!({"bob": [
            {"From": "bob", "Created": "2024-01-05 10:00:00 UTC", "IsSender": true},
            {"From": "bob", "Created": "2024-01-05 10:00:01 UTC", "IsSender": null},
            {"From": "bob", "Created(microseconds)": "soon"}
        ]});
        let (convs, skipped) =
            parse_table(&raw.to_string(), RecordKind::Message, Path::new("chat.json")).unwrap();
        assert_eq!(skipped, 2);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].records.len(), 1);
        assert!(convs[0].records[0].is_sender);
    }

    #[test]
    fn non_array_conversation_is_skipped_whole() {
        let raw = json!({"bob": {"not": "rows"}, "amy": []});
        let (convs, skipped) =
            parse_table(&raw.to_string(), RecordKind::Message, Path::new("chat.json")).unwrap();
        assert_eq!(skipped, 1);
        let ids: Vec<_> = convs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["amy"]);
    }

    #[test]
    fn text_records_do_not_expect_media() {
        let raw = json!({"bob": [
            {"Created": "2024-01-05 10:00:00 UTC", "Media Type": "TEXT"},
            {"Created": "2024-01-05 10:00:00 UTC", "Media Type": "MEDIA"},
            {"Created": "2024-01-05 10:00:00 UTC"}
        ]});
        let (convs, _) =
            parse_table(&raw.to_string(), RecordKind::Message, Path::new("chat.json")).unwrap();
        let flags: Vec<_> = convs[0].records.iter().map(MessageRecord::expects_media).collect();
        assert_eq!(flags, vec![false, true, true]);
    }

    #[test]
    fn display_names_collected_across_categories() {
        let root = json!({
            "Friends": [{"Username": "alice", "Display Name": "Alice"}],
            "Blocked Users": [{"Username": "eve"}],
            "Meta": "not-a-list"
        });
        let names = display_names_from(&root);
        assert_eq!(names.get("alice").map(String::as_str), Some("Alice"));
        assert_eq!(names.get("eve").map(String::as_str), Some(""));
    }

    #[test]
    fn owner_falls_back_when_nothing_was_sent() {
        assert_eq!(find_owner(&ExportTables::default()), "unknown_user");
    }
}
