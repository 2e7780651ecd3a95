use crate::error::SplitError;
use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;

pub const DEFAULT_AVATAR_ENDPOINT: &str = "https://app.snapchat.com/web/deeplink/snapcode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub threshold_secs: u64,
    pub overlay_penalty_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            threshold_secs: 30,
            overlay_penalty_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvatarConfig {
    pub fetch_enabled: bool,
    pub endpoint: String,
    pub max_workers: usize,
    pub timeout_secs: u64,
    pub retry_total: u32,
    pub backoff_factor: f64,
    pub size: u32,
}

impl Default for AvatarConfig {
    fn default() -> Self {
        Self {
            fetch_enabled: true,
            endpoint: DEFAULT_AVATAR_ENDPOINT.to_string(),
            max_workers: 8,
            timeout_secs: 10,
            retry_total: 3,
            backoff_factor: 0.5,
            size: 54,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub copy_orphans: bool,
    pub keep_work_dir: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            copy_orphans: true,
            keep_work_dir: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SplitConfig {
    pub matching: MatchingConfig,
    pub avatars: AvatarConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSplitConfig {
    matching: Option<MatchingConfig>,
    avatars: Option<AvatarConfig>,
    output: Option<OutputConfig>,
}

fn env_or_u64(var: &str, fallback: u64) -> u64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<u64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_f64(var: &str, fallback: f64) -> f64 {
    match env::var(var) {
        Ok(v) => v.trim().parse::<f64>().ok().unwrap_or(fallback),
        Err(_) => fallback,
    }
}

fn env_or_bool(var: &str, fallback: bool) -> bool {
    match env::var(var) {
        Ok(v) => match v.trim() {
            "1" | "true" | "TRUE" | "yes" | "on" => true,
            "0" | "false" | "FALSE" | "no" | "off" => false,
            _ => fallback,
        },
        Err(_) => fallback,
    }
}

fn env_or_string(var: &str, fallback: &str) -> String {
    match env::var(var) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => fallback.to_string(),
    }
}

pub fn validate(cfg: &SplitConfig) -> Result<()> {
    if cfg.matching.threshold_secs == 0 {
        return Err(anyhow!("invalid match threshold: must be >= 1 second"));
    }
    if cfg.matching.threshold_secs > 86_400 {
        return Err(anyhow!(
            "invalid match threshold: must not exceed the one-day search window"
        ));
    }
    if cfg.avatars.max_workers == 0 {
        return Err(anyhow!("invalid avatar workers: must be >= 1"));
    }
    if cfg.avatars.timeout_secs == 0 {
        return Err(anyhow!("invalid avatar timeout: must be >= 1 second"));
    }
    if !(cfg.avatars.backoff_factor >= 0.0 && cfg.avatars.backoff_factor.is_finite()) {
        return Err(anyhow!("invalid avatar backoff factor: require a finite value >= 0"));
    }
    if cfg.avatars.size == 0 {
        return Err(anyhow!("invalid avatar size: must be >= 1"));
    }
    if cfg.avatars.fetch_enabled && cfg.avatars.endpoint.trim().is_empty() {
        return Err(anyhow!("invalid avatar endpoint: cannot be empty while fetching is enabled"));
    }
    Ok(())
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(custom) = env::var("SNAPSPLIT_CONFIG_PATH") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let base = dirs::config_dir()?;
    Some(base.join("snapsplit").join("config.toml"))
}

fn merge_file_config(base: &mut SplitConfig) -> Result<()> {
    let Some(path) = resolve_config_path() else {
        return Ok(());
    };
    if !path.exists() {
        return Ok(());
    }

    let raw = fs::read_to_string(&path)
        .map_err(|err| SplitError::InvalidConfig(format!("{}: {err}", path.display())))?;
    let parsed: PartialSplitConfig = toml::from_str(&raw)
        .map_err(|err| SplitError::InvalidConfig(format!("{}: {err}", path.display())))?;
    if let Some(matching) = parsed.matching {
        base.matching = matching;
    }
    if let Some(avatars) = parsed.avatars {
        base.avatars = avatars;
    }
    if let Some(output) = parsed.output {
        base.output = output;
    }
    Ok(())
}

pub fn load_config() -> Result<SplitConfig> {
    let mut cfg = SplitConfig::default();
    merge_file_config(&mut cfg)?;

    cfg.matching.threshold_secs =
        env_or_u64("SNAPSPLIT_MATCH_THRESHOLD_SECS", cfg.matching.threshold_secs);
    cfg.matching.overlay_penalty_secs = env_or_u64(
        "SNAPSPLIT_OVERLAY_PENALTY_SECS",
        cfg.matching.overlay_penalty_secs,
    );
    cfg.avatars.fetch_enabled = env_or_bool("SNAPSPLIT_AVATAR_FETCH", cfg.avatars.fetch_enabled);
    cfg.avatars.endpoint = env_or_string("SNAPSPLIT_AVATAR_ENDPOINT", &cfg.avatars.endpoint);
    cfg.avatars.max_workers =
        env_or_u64("SNAPSPLIT_AVATAR_WORKERS", cfg.avatars.max_workers as u64) as usize;
    cfg.avatars.timeout_secs =
        env_or_u64("SNAPSPLIT_AVATAR_TIMEOUT_SECS", cfg.avatars.timeout_secs);
    cfg.avatars.retry_total =
        env_or_u64("SNAPSPLIT_AVATAR_RETRIES", u64::from(cfg.avatars.retry_total)) as u32;
    cfg.avatars.backoff_factor =
        env_or_f64("SNAPSPLIT_AVATAR_BACKOFF", cfg.avatars.backoff_factor);
    cfg.output.copy_orphans = env_or_bool("SNAPSPLIT_COPY_ORPHANS", cfg.output.copy_orphans);
    cfg.output.keep_work_dir = env_or_bool("SNAPSPLIT_KEEP_WORK_DIR", cfg.output.keep_work_dir);

    validate(&cfg).map_err(|err| SplitError::InvalidConfig(err.to_string()))?;
    Ok(cfg)
}
