//! Avatar synthesis: one SVG per distinct username.
//!
//! The remote snapcode endpoint is tried first; any failure (transport,
//! timeout, bad status, unusable body) turns into a ghost silhouette whose
//! colour is derived from SHA-256 of the username, so the result never
//! depends on the network or on which other users were processed.

use crate::snap::config::AvatarConfig;
use crate::snap::progress;
use crate::snap::util::sanitize_filename;
use anyhow::{Context, Result, anyhow, bail};
use rayon::prelude::*;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const AVATAR_DIR: &str = "bitmoji";

const USER_AGENT: &str = concat!("snapsplit/", env!("CARGO_PKG_VERSION"));
const RETRY_STATUSES: [StatusCode; 5] = [
    StatusCode::TOO_MANY_REQUESTS,
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

const GHOST_PATH: &str = "M27 54.06C33.48 54.06 39.48 51.78 44.16 47.94C43.32 46.68 42.36 45.78 41.34 44.94C38.22 42.48 \
33.78 41.58 30.72 41.04L30.6 39.84C35.28 37.08 36.42 34.14 38.28 27.96L38.34 27.54C38.34 27.54 \
39.96 26.88 40.2 23.88C40.56 19.8 38.88 21 38.88 20.7C39.06 18.6 39 15.84 38.4 13.8C37.14 9.42 \
32.88 5.94 27 5.94C21.12 5.94 16.86 9.36 15.6 13.8C15 15.84 14.94 18.6 15.12 20.76C15.12 21.06 \
13.5 19.86 13.8 23.94C14.04 26.94 15.66 27.6 15.66 27.6L15.72 28.02C17.58 34.2 18.72 37.14 \
23.4 39.9L23.28 41.1C20.28 41.64 15.78 42.54 12.66 45C11.64 45.84 10.68 46.74 9.84 48C14.52 \
51.78 20.52 54.06 27 54.06Z";

static IMAGE_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<(?:svg:)?image\b([^>]*)>").expect("image tag pattern is valid"));
static XLINK_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"xlink:href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("xlink href pattern is valid")
});
static PLAIN_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)href\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("href pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvatarSource {
    Fetched,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Avatar {
    pub username: String,
    pub svg: String,
    pub source: AvatarSource,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AvatarStats {
    pub fetched: usize,
    pub fallback: usize,
    pub workers: usize,
}

/// Python-compatible HLS -> RGB, components in `0.0..=1.0`.
fn hls_to_rgb(h: f64, l: f64, s: f64) -> (f64, f64, f64) {
    if s == 0.0 {
        return (l, l, l);
    }
    let m2 = if l <= 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let m1 = 2.0 * l - m2;
    (
        hue_channel(m1, m2, h + 1.0 / 3.0),
        hue_channel(m1, m2, h),
        hue_channel(m1, m2, h - 1.0 / 3.0),
    )
}

fn hue_channel(m1: f64, m2: f64, hue: f64) -> f64 {
    let hue = hue.rem_euclid(1.0);
    if hue < 1.0 / 6.0 {
        m1 + (m2 - m1) * hue * 6.0
    } else if hue < 0.5 {
        m2
    } else if hue < 2.0 / 3.0 {
        m1 + (m2 - m1) * (2.0 / 3.0 - hue) * 6.0
    } else {
        m1
    }
}

pub fn fallback_color(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    let hue = u16::from_le_bytes([digest[0], digest[1]]) % 360;
    let (r, g, b) = hls_to_rgb(f64::from(hue) / 360.0, 0.60, 0.30);
    let channel = |v: f64| (v * 255.0) as u8;
    format!("#{:02x}{:02x}{:02x}", channel(r), channel(g), channel(b))
}

pub fn fallback_svg(username: &str, size: u32) -> String {
    format!(
        r#"<svg viewBox="0 0 {size} {size}" xmlns="http://www.w3.org/2000/svg"><path d="{GHOST_PATH}" fill="{}" stroke="black" stroke-opacity="0.2" stroke-width="0.9"/></svg>"#,
        fallback_color(username)
    )
}

fn first_capture(re: &Regex, haystack: &str) -> Option<String> {
    let caps = re.captures(haystack)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// The `href` of the first `<image>` element, preferring `xlink:href`.
pub fn extract_image_href(svg: &str) -> Option<String> {
    let attrs = IMAGE_TAG.captures(svg)?.get(1)?.as_str();
    first_capture(&XLINK_HREF, attrs)
        .or_else(|| first_capture(&PLAIN_HREF, attrs))
        .filter(|href| !href.trim().is_empty())
}

fn wrap_image(href: &str, size: u32) -> String {
    format!(
        r#"<svg viewBox="0 0 {size} {size}" xmlns="http://www.w3.org/2000/svg" xmlns:xlink="http://www.w3.org/1999/xlink"><image href="{href}" x="0" y="0" width="{size}" height="{size}"/></svg>"#
    )
}

pub struct AvatarSynthesizer {
    client: Option<Client>,
    config: AvatarConfig,
}

impl AvatarSynthesizer {
    pub fn new(config: &AvatarConfig) -> Result<Self> {
        let client = if config.fetch_enabled {
            Some(
                Client::builder()
                    .timeout(Duration::from_secs(config.timeout_secs))
                    .user_agent(USER_AGENT)
                    .pool_max_idle_per_host(config.max_workers)
                    .build()
                    .context("failed to build avatar http client")?,
            )
        } else {
            None
        };
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64((self.config.backoff_factor * exp).min(60.0))
    }

    fn fetch_body(&self, client: &Client, username: &str) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            let result = client
                .get(&self.config.endpoint)
                .query(&[("username", username), ("type", "SVG"), ("bitmoji", "enable")])
                .send();
            let retry_reason = match result {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().context("failed to read avatar response body");
                }
                Ok(resp) if RETRY_STATUSES.contains(&resp.status()) => {
                    format!("status {}", resp.status())
                }
                Ok(resp) => bail!("avatar endpoint returned {}", resp.status()),
                Err(err) if err.is_timeout() || err.is_connect() || err.is_request() => {
                    err.to_string()
                }
                Err(err) => return Err(err.into()),
            };
            if attempt >= self.config.retry_total {
                bail!("giving up after {} attempts: {retry_reason}", attempt + 1);
            }
            attempt += 1;
            debug!(username, attempt, reason = %retry_reason, "retrying avatar fetch");
            thread::sleep(self.backoff(attempt));
        }
    }

    fn fetch(&self, username: &str) -> Result<String> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("avatar fetching disabled"))?;
        let body = self.fetch_body(client, username)?;
        let href = extract_image_href(&body).ok_or_else(|| anyhow!("no <image> href in snapcode svg"))?;
        Ok(wrap_image(&href, self.config.size))
    }

    /// Never fails: any fetch problem yields the deterministic fallback.
    pub fn synthesize(&self, username: &str) -> Avatar {
        match self.fetch(username) {
            Ok(svg) => Avatar {
                username: username.to_string(),
                svg,
                source: AvatarSource::Fetched,
            },
            Err(err) => {
                if self.client.is_some() {
                    warn!(username, error = %format!("{err:#}"), "avatar fetch failed, using fallback");
                }
                Avatar {
                    username: username.to_string(),
                    svg: fallback_svg(username, self.config.size),
                    source: AvatarSource::Fallback,
                }
            }
        }
    }

    /// Synthesize every username on a bounded pool and wait for all of them.
    pub fn synthesize_all(
        &self,
        usernames: &BTreeSet<String>,
    ) -> Result<(BTreeMap<String, Avatar>, AvatarStats)> {
        let names: Vec<&str> = usernames
            .iter()
            .map(String::as_str)
            .filter(|u| !u.is_empty())
            .collect();
        if names.is_empty() {
            return Ok((BTreeMap::new(), AvatarStats::default()));
        }

        let workers = self.config.max_workers.min(names.len()).max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("avatar-{i}"))
            .build()
            .context("failed to start avatar worker pool")?;

        info!(users = names.len(), workers, "synthesizing avatars");
        let completed = AtomicUsize::new(0);
        let bar = progress::bar(names.len() as u64, "Fetching avatars");
        let avatars: Vec<Avatar> = pool.install(|| {
            names
                .par_iter()
                .map(|name| {
                    let avatar = self.synthesize(name);
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    bar.set_position(done as u64);
                    avatar
                })
                .collect()
        });
        bar.finish_and_clear();

        let mut stats = AvatarStats {
            workers,
            ..AvatarStats::default()
        };
        for avatar in &avatars {
            match avatar.source {
                AvatarSource::Fetched => stats.fetched += 1,
                AvatarSource::Fallback => stats.fallback += 1,
            }
        }
        info!(
            fetched = stats.fetched,
            fallback = stats.fallback,
            workers,
            "avatar synthesis complete"
        );

        let map = avatars
            .into_iter()
            .map(|avatar| (avatar.username.clone(), avatar))
            .collect();
        Ok((map, stats))
    }
}

fn collision_suffix(username: &str) -> String {
    let digest = Sha256::digest(username.as_bytes());
    digest.iter().take(3).map(|b| format!("{b:02x}")).collect()
}

/// Write each avatar as `<sanitized>.svg` under `dir`; returns username ->
/// path relative to the output root.
pub fn save_avatars(avatars: &BTreeMap<String, Avatar>, dir: &Path) -> Result<BTreeMap<String, String>> {
    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let mut used: HashMap<String, String> = HashMap::new();
    let mut out = BTreeMap::new();
    for (username, avatar) in avatars {
        let base = sanitize_filename(username).to_lowercase();
        let mut candidate = base.clone();
        if used.get(&candidate).is_some_and(|owner| owner != username) {
            candidate = format!("{base}-{}", collision_suffix(username));
        }
        used.insert(candidate.clone(), username.clone());

        let file_name = format!("{candidate}.svg");
        let path = dir.join(&file_name);
        fs::write(&path, &avatar.svg).with_context(|| format!("failed to write {}", path.display()))?;
        out.insert(username.clone(), format!("{AVATAR_DIR}/{file_name}"));
    }
    info!(count = out.len(), dir = %dir.display(), "saved avatars");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    fn offline_config() -> AvatarConfig {
        AvatarConfig {
            fetch_enabled: true,
            endpoint: "http://127.0.0.1:1/snapcode".to_string(),
            max_workers: 2,
            timeout_secs: 2,
            retry_total: 0,
            backoff_factor: 0.0,
            size: 54,
        }
    }

    #[test]
    fn fallback_is_byte_identical_across_runs() {
        let synth = AvatarSynthesizer::new(&offline_config()).expect("client");
        let first = synth.synthesize("alice");
        let second = synth.synthesize("alice");
        assert_eq!(first.source, AvatarSource::Fallback);
        assert_eq!(second.source, AvatarSource::Fallback);
        assert_eq!(first.svg.as_bytes(), second.svg.as_bytes());
        assert!(first.svg.contains(&fallback_color("alice")));
    }

    #[test]
    fn fallback_colour_depends_only_on_the_name() {
        assert_eq!(fallback_color("alice"), fallback_color("alice"));
        assert_ne!(fallback_color("alice"), fallback_color("bob"));
        assert_eq!(fallback_color("alice").len(), 7);
    }

    #[test]
    fn hls_matches_python_colorsys() {
        // colorsys.hls_to_rgb(0.0, 0.6, 0.3) == (0.72, 0.48, 0.48)
        let (r, g, b) = hls_to_rgb(0.0, 0.6, 0.3);
        assert!((r - 0.72).abs() < 1e-9);
        assert!((g - 0.48).abs() < 1e-9);
        assert!((b - 0.48).abs() < 1e-9);
    }

    #[test]
    fn href_extraction_prefers_xlink() {
        let svg = r#"<svg xmlns="http://www.w3.org/2000/svg"><rect/><image x="1" href="plain" xlink:href="data:image/png;base64,AAA"/></svg>"#;
        assert_eq!(extract_image_href(svg).as_deref(), Some("data:image/png;base64,AAA"));
        let plain = r#"<svg><image href='only'/></svg>"#;
        assert_eq!(extract_image_href(plain).as_deref(), Some("only"));
        assert_eq!(extract_image_href("<svg><rect/></svg>"), None);
    }

    #[test]
    fn disabled_fetching_uses_fallback_for_everyone() {
        let mut cfg = offline_config();
        cfg.fetch_enabled = false;
        let synth = AvatarSynthesizer::new(&cfg).expect("synth");
        let names: BTreeSet<String> = ["amy", "bob", ""].iter().map(|s| s.to_string()).collect();
        let (avatars, stats) = synth.synthesize_all(&names).expect("all");
        assert_eq!(avatars.len(), 2);
        assert_eq!(stats.fallback, 2);
        assert_eq!(stats.fetched, 0);
    }

    #[test]
    fn successful_fetch_is_rewrapped() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut request_line = String::new();
            reader.read_line(&mut request_line).expect("request line");
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).expect("header");
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let body = r#"<svg xmlns:xlink="http://www.w3.org/1999/xlink"><image xlink:href="data:image/png;base64,QQ=="/></svg>"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/svg+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).expect("respond");
            request_line
        });

        let mut cfg = offline_config();
        cfg.endpoint = format!("http://{addr}/snapcode");
        let synth = AvatarSynthesizer::new(&cfg).expect("synth");
        let avatar = synth.synthesize("alice");
        let request_line = server.join().expect("server thread");

        assert!(request_line.contains("username=alice"));
        assert_eq!(avatar.source, AvatarSource::Fetched);
        assert!(avatar.svg.contains(r#"<image href="data:image/png;base64,QQ==""#));
        assert!(avatar.svg.contains(r#"width="54""#));
    }

    #[test]
    fn saved_names_are_sanitized_and_deduplicated() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut avatars = BTreeMap::new();
        for name in ["Bob", "bob", "a b"] {
            avatars.insert(
                name.to_string(),
                Avatar {
                    username: name.to_string(),
                    svg: fallback_svg(name, 54),
                    source: AvatarSource::Fallback,
                },
            );
        }
        let paths = save_avatars(&avatars, tmp.path()).expect("save");
        assert_eq!(paths["Bob"], "bitmoji/bob.svg");
        assert_eq!(paths["bob"], format!("bitmoji/bob-{}.svg", collision_suffix("bob")));
        assert_eq!(paths["a b"], "bitmoji/a_b.svg");
        assert!(tmp.path().join("a_b.svg").is_file());
    }
}
