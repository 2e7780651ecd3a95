use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Keep `[A-Za-z0-9_.-]`, replace everything else with `_`.
pub fn sanitize_filename(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return "user".to_string();
    }
    trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Pretty JSON plus trailing newline, written through a temp file in the
/// same directory and renamed into place.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;

    let data = serde_json::to_string_pretty(value)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage {}", path.display()))?;
    tmp.write_all(data.as_bytes())?;
    tmp.write_all(b"\n")?;
    tmp.persist(path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_filename("a b/c"), "a_b_c");
        assert_eq!(sanitize_filename("  "), "user");
        assert_eq!(sanitize_filename("jo.doe-1_x"), "jo.doe-1_x");
        assert_eq!(sanitize_filename("zoë"), "zo_");
    }

    #[test]
    fn write_json_creates_parents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("a/b/doc.json");
        write_json(&path, &serde_json::json!({"k": 1})).expect("write");
        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.ends_with("}\n"));
        assert!(raw.contains("\"k\": 1"));
    }
}
