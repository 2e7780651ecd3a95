//! Groups message records into `days[date][conversation]` buckets.
//!
//! Days iterate in ascending date order; conversations inside a day keep the
//! order in which they were first seen; messages keep arrival order. The
//! correlation passes walk this order, so it is part of the output contract.

use crate::snap::records::{ExportTables, MessageRecord};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A conversation id containing this character is a group chat.
pub const GROUP_SEPARATOR: char = '-';

pub fn is_group_conversation(conversation_id: &str) -> bool {
    conversation_id.contains(GROUP_SEPARATOR)
}

#[derive(Debug, Clone)]
pub struct ConversationBucket {
    pub id: String,
    pub messages: Vec<MessageRecord>,
}

impl ConversationBucket {
    pub fn is_group(&self) -> bool {
        is_group_conversation(&self.id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DayBucket {
    conversations: Vec<ConversationBucket>,
    positions: HashMap<String, usize>,
}

impl DayBucket {
    fn push(&mut self, record: MessageRecord) {
        let slot = match self.positions.get(&record.conversation_id) {
            Some(&idx) => idx,
            None => {
                let idx = self.conversations.len();
                self.positions.insert(record.conversation_id.clone(), idx);
                self.conversations.push(ConversationBucket {
                    id: record.conversation_id.clone(),
                    messages: Vec::new(),
                });
                idx
            }
        };
        self.conversations[slot].messages.push(record);
    }

    pub fn conversations(&self) -> &[ConversationBucket] {
        &self.conversations
    }

    pub fn message_count(&self) -> usize {
        self.conversations.iter().map(|c| c.messages.len()).sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DayIndex {
    days: BTreeMap<NaiveDate, DayBucket>,
}

impl DayIndex {
    pub fn insert(&mut self, record: MessageRecord) {
        self.days.entry(record.date()).or_default().push(record);
    }

    pub fn get(&self, date: NaiveDate) -> Option<&DayBucket> {
        self.days.get(&date)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NaiveDate, &DayBucket)> {
        self.days.iter()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    pub fn message_count(&self) -> usize {
        self.days.values().map(DayBucket::message_count).sum()
    }

    /// Every message, mutably, in day / conversation / arrival order.
    pub fn messages_mut(&mut self) -> impl Iterator<Item = &mut MessageRecord> {
        self.days
            .values_mut()
            .flat_map(|day| day.conversations.iter_mut())
            .flat_map(|conv| conv.messages.iter_mut())
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageRecord> {
        self.days
            .values()
            .flat_map(|day| day.conversations.iter())
            .flat_map(|conv| conv.messages.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexedExport {
    pub days: DayIndex,
    pub usernames: BTreeSet<String>,
    pub groups: Vec<GroupInfo>,
    pub group_titles: BTreeMap<String, String>,
}

impl IndexedExport {
    pub fn group_name(&self, conversation_id: &str) -> String {
        self.group_titles
            .get(conversation_id)
            .cloned()
            .unwrap_or_else(|| conversation_id.to_string())
    }
}

/// Build the day index from both export tables, chats first, and collect
/// the usernames and group descriptors seen along the way.
pub fn build_days(tables: ExportTables) -> IndexedExport {
    let mut out = IndexedExport::default();

    for conv in tables.chats {
        let mut participants = BTreeSet::new();
        let mut title: Option<String> = None;
        for record in &conv.records {
            if let Some(from) = record.sender.as_deref().filter(|f| !f.is_empty()) {
                out.usernames.insert(from.to_string());
                participants.insert(from.to_string());
            }
            if title.is_none() {
                title = record
                    .conversation_title
                    .clone()
                    .filter(|t| !t.is_empty());
            }
        }

        if is_group_conversation(&conv.id) {
            let name = title.unwrap_or_else(|| conv.id.clone());
            out.group_titles.insert(conv.id.clone(), name.clone());
            out.groups.push(GroupInfo {
                group_id: conv.id.clone(),
                name,
                members: participants.into_iter().collect(),
            });
        } else {
            out.usernames.insert(conv.id.clone());
        }

        for record in conv.records {
            out.days.insert(record);
        }
    }

    for conv in tables.snaps {
        let group = is_group_conversation(&conv.id);
        for record in &conv.records {
            if let Some(from) = record.sender.as_deref().filter(|f| !f.is_empty()) {
                out.usernames.insert(from.to_string());
            }
            if group && !out.group_titles.contains_key(&conv.id) {
                if let Some(title) = record.conversation_title.as_deref().filter(|t| !t.is_empty()) {
                    out.group_titles.insert(conv.id.clone(), title.to_string());
                }
            }
        }
        if !group {
            out.usernames.insert(conv.id.clone());
        }
        for record in conv.records {
            out.days.insert(record);
        }
    }

    out
}
