//! Two-pass media correlation.
//!
//! Pass 1 binds files named by a message's `Media IDs`. Pass 2 gives every
//! message with an open media slot (an identifier that bound nothing, or no
//! identifiers at all) the closest unclaimed overlay/other file within the
//! proximity threshold, scored as `|dt| + overlay penalty`.
//! Pass 2 is greedy: messages are visited in day / conversation / arrival
//! order and the first to reach a file keeps it.

use crate::snap::config::MatchingConfig;
use crate::snap::days::DayIndex;
use crate::snap::media::{MediaCatalog, MediaFile};
use crate::snap::records::MessageRecord;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchSource {
    Identifier,
    Proximity,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedMedia {
    pub file: Arc<MediaFile>,
    pub source: MatchSource,
    /// Absolute message/file time difference, proximity matches only.
    pub delta_millis: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationStats {
    pub messages: usize,
    pub identifier_matches: usize,
    pub unresolved_identifiers: usize,
    pub proximity_matches: usize,
    pub residual: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CorrelationOutcome {
    /// Files neither pass claimed, sorted by file name.
    pub residual: Vec<Arc<MediaFile>>,
    pub stats: CorrelationStats,
}

#[derive(Debug)]
struct Slot {
    file: Arc<MediaFile>,
    consumed: bool,
}

/// The catalog as the engine sees it while matching.
#[derive(Debug, Default)]
struct MediaPool {
    slots: Vec<Slot>,
    by_id: HashMap<String, usize>,
    /// Overlay and other files by the UTC date of their instant.
    by_day: BTreeMap<NaiveDate, Vec<usize>>,
}

impl MediaPool {
    fn new(catalog: MediaCatalog) -> Self {
        let mut pool = MediaPool::default();
        for (id, file) in catalog.by_id {
            let idx = pool.push(file);
            pool.by_id.insert(id, idx);
        }
        for file in catalog.overlays.into_iter().chain(catalog.others) {
            let day = file.instant.date_naive();
            let idx = pool.push(file);
            pool.by_day.entry(day).or_default().push(idx);
        }
        pool
    }

    fn push(&mut self, file: MediaFile) -> usize {
        self.slots.push(Slot {
            file: Arc::new(file),
            consumed: false,
        });
        self.slots.len() - 1
    }

    fn into_residual(self) -> Vec<Arc<MediaFile>> {
        let mut out: Vec<_> = self
            .slots
            .into_iter()
            .filter(|slot| !slot.consumed)
            .map(|slot| slot.file)
            .collect();
        out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        out
    }
}

#[derive(Debug, Clone)]
struct MatchCandidate<'a> {
    slot: usize,
    file: &'a MediaFile,
    delta_millis: i64,
    score: i64,
}

impl MatchCandidate<'_> {
    /// Total order: score, then earliest file instant, then file name.
    fn rank(&self) -> (i64, DateTime<Utc>, &str) {
        (self.score, self.file.instant, self.file.file_name.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Correlator {
    threshold_millis: i64,
    overlay_penalty_millis: i64,
}

impl Correlator {
    pub fn new(config: &MatchingConfig) -> Self {
        Self {
            threshold_millis: secs_to_millis(config.threshold_secs),
            overlay_penalty_millis: secs_to_millis(config.overlay_penalty_secs),
        }
    }

    pub fn correlate(&self, days: &mut DayIndex, catalog: MediaCatalog) -> CorrelationOutcome {
        let mut pool = MediaPool::new(catalog);
        let mut stats = CorrelationStats::default();

        for message in days.messages_mut() {
            stats.messages += 1;
            for id in message.media_ids.iter() {
                let Some(&idx) = pool.by_id.get(id) else {
                    stats.unresolved_identifiers += 1;
                    continue;
                };
                let slot = &mut pool.slots[idx];
                slot.consumed = true;
                message.matched_media.push(MatchedMedia {
                    file: Arc::clone(&slot.file),
                    source: MatchSource::Identifier,
                    delta_millis: None,
                });
                stats.identifier_matches += 1;
            }
        }

        for message in days.messages_mut() {
            if open_slots(message) == 0 || !message.expects_media() {
                continue;
            }
            let Some((idx, delta_millis)) = self.best_candidate(&pool, message.timestamp) else {
                continue;
            };
            let slot = &mut pool.slots[idx];
            slot.consumed = true;
            message.matched_media.push(MatchedMedia {
                file: Arc::clone(&slot.file),
                source: MatchSource::Proximity,
                delta_millis: Some(delta_millis),
            });
            stats.proximity_matches += 1;
        }

        let residual = pool.into_residual();
        stats.residual = residual.len();
        CorrelationOutcome { residual, stats }
    }

    fn candidates<'a>(
        &self,
        pool: &'a MediaPool,
        at: DateTime<Utc>,
    ) -> impl Iterator<Item = MatchCandidate<'a>> + 'a {
        let date = at.date_naive();
        let threshold = self.threshold_millis;
        let penalty = self.overlay_penalty_millis;
        [date.pred_opt(), Some(date), date.succ_opt()]
            .into_iter()
            .flatten()
            .filter_map(move |day| pool.by_day.get(&day))
            .flatten()
            .filter_map(move |&idx| {
                let slot = &pool.slots[idx];
                if slot.consumed {
                    return None;
                }
                let delta_millis = (slot.file.instant - at).num_milliseconds().abs();
                if delta_millis > threshold {
                    return None;
                }
                let score = if slot.file.is_overlay() {
                    delta_millis.saturating_add(penalty)
                } else {
                    delta_millis
                };
                Some(MatchCandidate {
                    slot: idx,
                    file: slot.file.as_ref(),
                    delta_millis,
                    score,
                })
            })
    }

    fn best_candidate(&self, pool: &MediaPool, at: DateTime<Utc>) -> Option<(usize, i64)> {
        self.candidates(pool, at)
            .min_by(|a, b| a.rank().cmp(&b.rank()))
            .map(|c| (c.slot, c.delta_millis))
    }
}

/// Media slots left after pass 1. A media message without identifiers
/// still has one.
fn open_slots(message: &MessageRecord) -> usize {
    let bound = message
        .matched_media
        .iter()
        .filter(|m| m.source == MatchSource::Identifier)
        .count();
    message.media_ids.len().max(1).saturating_sub(bound)
}

fn secs_to_millis(secs: u64) -> i64 {
    i64::try_from(secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
}
