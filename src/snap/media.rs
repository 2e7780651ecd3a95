use crate::snap::warn::{self, WarnEvent};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const OVERLAY_MARKER: &str = "_overlay~";
const THUMBNAIL_MARKER: &str = "thumbnail";

// `<date>_b~<id>.<ext>`; the captured id is what chat rows list in `Media IDs`.
static MEDIA_ID_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^_]*_(b~.+)\.\w+$").expect("media id pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MediaClass {
    Identified,
    Overlay,
    Other,
}

/// A file under `chat_media/` with its resolved modification instant.
#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub instant: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub file_name: String,
    pub path: PathBuf,
    pub instant: DateTime<Utc>,
    pub class: MediaClass,
    pub media_id: Option<String>,
}

impl MediaFile {
    pub fn is_overlay(&self) -> bool {
        self.class == MediaClass::Overlay
    }
}

#[derive(Debug, Clone, Default)]
pub struct MediaCatalog {
    pub by_id: BTreeMap<String, MediaFile>,
    pub overlays: Vec<MediaFile>,
    pub others: Vec<MediaFile>,
    /// Thumbnails and other files never offered for matching.
    pub skipped: usize,
    pub id_collisions: usize,
}

impl MediaCatalog {
    pub fn len(&self) -> usize {
        self.by_id.len() + self.overlays.len() + self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Decide the class of a bare file name. `None` means the file is not a
/// matchable media file at all (thumbnails).
pub fn classify_file_name(file_name: &str) -> Option<(MediaClass, Option<String>)> {
    if file_name.to_ascii_lowercase().contains(THUMBNAIL_MARKER) {
        return None;
    }
    if file_name.contains(OVERLAY_MARKER) {
        return Some((MediaClass::Overlay, None));
    }
    if let Some(caps) = MEDIA_ID_NAME.captures(file_name) {
        return Some((MediaClass::Identified, Some(caps[1].to_string())));
    }
    Some((MediaClass::Other, None))
}

pub fn classify_media(entries: impl IntoIterator<Item = MediaEntry>) -> MediaCatalog {
    let mut catalog = MediaCatalog::default();
    for entry in entries {
        let Some((class, media_id)) = classify_file_name(&entry.file_name) else {
            catalog.skipped += 1;
            continue;
        };
        let file = MediaFile {
            file_name: entry.file_name,
            path: entry.path,
            instant: entry.instant,
            class,
            media_id: media_id.clone(),
        };
        match (class, media_id) {
            (MediaClass::Identified, Some(id)) => {
                if let Some(previous) = catalog.by_id.insert(id.clone(), file) {
                    catalog.id_collisions += 1;
                    warn::emit(WarnEvent {
                        code: "MEDIA_ID_COLLISION",
                        stage: "classify",
                        item: &id,
                        reason: "later-file-replaces-earlier",
                        err: &previous.file_name,
                    });
                }
            }
            (MediaClass::Overlay, _) => catalog.overlays.push(file),
            _ => catalog.others.push(file),
        }
    }
    catalog
}

/// Build media entries from an already extracted directory, using each
/// file's modification time. Entries come back sorted by file name.
pub fn scan_media_dir(dir: &Path) -> Result<Vec<MediaEntry>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(ToOwned::to_owned)
        else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .with_context(|| format!("failed to stat {}", path.display()))?;
        out.push(MediaEntry {
            path,
            file_name,
            instant: DateTime::<Utc>::from(modified),
        });
    }
    out.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(name: &str) -> MediaEntry {
        MediaEntry {
            path: PathBuf::from("chat_media").join(name),
            file_name: name.to_string(),
            instant: Utc.with_ymd_and_hms(2024, 1, 5, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn file_names_map_to_exactly_one_class() {
        assert_eq!(
            classify_file_name("2024-01-05_b~EiASFW.jpeg"),
            Some((MediaClass::Identified, Some("b~EiASFW".to_string())))
        );
        assert_eq!(
            classify_file_name("2024-01-05_overlay~Q1.webp"),
            Some((MediaClass::Overlay, None))
        );
        assert_eq!(
            classify_file_name("2024-01-05_media~Q1.mp4"),
            Some((MediaClass::Other, None))
        );
        assert_eq!(classify_file_name("random.bin"), Some((MediaClass::Other, None)));
        assert_eq!(classify_file_name("2024-01-05_thumbnail~Q1.jpg"), None);
    }

    #[test]
    fn catalog_partitions_entries() {
        let catalog = classify_media(vec![
            entry("2024-01-05_b~A.jpg"),
            entry("2024-01-05_overlay~B.png"),
            entry("2024-01-05_media~C.mp4"),
            entry("2024-01-05_Thumbnail~C.jpg"),
        ]);
        assert_eq!(catalog.by_id.len(), 1);
        assert_eq!(catalog.overlays.len(), 1);
        assert_eq!(catalog.others.len(), 1);
        assert_eq!(catalog.skipped, 1);
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn id_collision_keeps_last_file() {
        let catalog = classify_media(vec![
            entry("2024-01-05_b~A.jpg"),
            entry("2024-01-06_b~A.jpg"),
        ]);
        assert_eq!(catalog.id_collisions, 1);
        assert_eq!(catalog.by_id["b~A"].file_name, "2024-01-06_b~A.jpg");
    }

    #[test]
    fn scan_reads_directory_sorted() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("b.jpg"), b"x").expect("write");
        fs::write(tmp.path().join("a.jpg"), b"x").expect("write");
        fs::create_dir(tmp.path().join("nested")).expect("mkdir");
        let entries = scan_media_dir(tmp.path()).expect("scan");
        let names: Vec<_> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn missing_directory_scans_empty() {
        let entries = scan_media_dir(Path::new("/definitely/not/here")).expect("scan");
        assert!(entries.is_empty());
    }
}
