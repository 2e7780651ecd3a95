use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitPaths {
    pub input_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl SplitPaths {
    pub fn lock_file(&self) -> PathBuf {
        self.output_dir.join(crate::snap::lock::LOCK_FILE)
    }

    pub fn avatar_dir(&self) -> PathBuf {
        self.output_dir.join(crate::snap::avatar::AVATAR_DIR)
    }
}

/// Command-line overrides; `None` falls through to env, then defaults.
#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub input_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

fn env_or_default_path(var: &str, fallback: PathBuf) -> PathBuf {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => PathBuf::from(v.trim()),
        _ => fallback,
    }
}

pub fn resolve_paths(overrides: &PathOverrides) -> SplitPaths {
    let input_dir = overrides
        .input_dir
        .clone()
        .unwrap_or_else(|| env_or_default_path("SNAPSPLIT_INPUT_DIR", PathBuf::from("input")));
    let work_dir = overrides
        .work_dir
        .clone()
        .unwrap_or_else(|| env_or_default_path("SNAPSPLIT_WORK_DIR", PathBuf::from("_tmp_extract")));
    let output_dir = overrides
        .output_dir
        .clone()
        .unwrap_or_else(|| env_or_default_path("SNAPSPLIT_OUTPUT_DIR", PathBuf::from("output")));

    SplitPaths {
        input_dir,
        work_dir,
        output_dir,
    }
}
