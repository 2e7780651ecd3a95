use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::time::Instant;
use tracing::info;

use crate::commands::CommandReport;
use crate::commands::avatars::synthesize_and_save;
use crate::snap::config::load_config;
use crate::snap::correlate::Correlator;
use crate::snap::days::build_days;
use crate::snap::extract::{self, ExtractOutcome};
use crate::snap::lock::RunLock;
use crate::snap::media::{classify_media, scan_media_dir};
use crate::snap::output::{OutputWriter, build_index, write_index};
use crate::snap::paths::{PathOverrides, SplitPaths, resolve_paths};
use crate::snap::records::{find_owner, load_display_names, load_tables};

#[derive(Debug, Clone, Default)]
pub struct SplitOptions {
    pub paths: PathOverrides,
    pub keep_work_dir: bool,
    pub reuse_work_dir: bool,
    pub no_avatars: bool,
}

fn prepare_work_dir(paths: &SplitPaths, reuse: bool, report: &mut CommandReport) -> Result<ExtractOutcome> {
    if reuse {
        let media = scan_media_dir(&paths.work_dir.join(extract::MEDIA_DIR))?;
        report.detail(format!("work_dir.reused={}", paths.work_dir.display()));
        return Ok(ExtractOutcome {
            json_dir: paths.work_dir.join(extract::JSON_DIR),
            media,
            ..ExtractOutcome::default()
        });
    }

    if paths.work_dir.exists() {
        fs::remove_dir_all(&paths.work_dir)
            .with_context(|| format!("failed to clear {}", paths.work_dir.display()))?;
    }
    let archives = extract::order_archives(&paths.input_dir)?;
    let outcome = extract::extract_archives(&archives, &paths.work_dir)?;

    for archive in &outcome.archives {
        report.detail(format!("archive={}", archive.display()));
    }
    report.detail(format!("extract.json_files={}", outcome.json_files));
    report.detail(format!("extract.media_files={}", outcome.media.len()));
    report.detail(format!("extract.skipped_entries={}", outcome.skipped_entries));
    let times = &outcome.time_sources;
    report.detail(format!(
        "extract.time_sources=extended:{} legacy:{} unknown:{} malformed_extra:{}",
        times.extended, times.legacy, times.unknown, times.malformed_extra
    ));
    Ok(outcome)
}

pub fn run(opts: &SplitOptions) -> Result<CommandReport> {
    let started = Instant::now();
    let mut cfg = load_config()?;
    if opts.keep_work_dir || opts.reuse_work_dir {
        cfg.output.keep_work_dir = true;
    }
    let paths = resolve_paths(&opts.paths);
    let mut report = CommandReport::new("split");
    report.detail(format!("input_dir={}", paths.input_dir.display()));
    report.detail(format!("work_dir={}", paths.work_dir.display()));
    report.detail(format!("output_dir={}", paths.output_dir.display()));

    let lock = RunLock::acquire(&paths.lock_file())?;
    report.detail(format!("lock={}", lock.path().display()));

    let extracted = prepare_work_dir(&paths, opts.reuse_work_dir, &mut report)?;
    let tables = load_tables(&extracted.json_dir)?;
    let display_names = load_display_names(&extracted.json_dir);
    let owner = find_owner(&tables);
    let skipped_records = tables.skipped_records;

    let mut export = build_days(tables);
    export.usernames.insert(owner.clone());
    report.detail(format!("account_owner={owner}"));
    report.detail(format!("records.skipped={skipped_records}"));
    if export.days.is_empty() {
        report.detail("days=0 (export holds no datable records)");
    } else {
        report.detail(format!("days={}", export.days.len()));
    }
    report.detail(format!("messages={}", export.days.message_count()));

    let catalog = classify_media(extracted.media);
    let catalogued = catalog.len();
    if catalog.is_empty() {
        report.detail("media.catalogued=0 (no chat media in export)");
    } else {
        report.detail(format!("media.catalogued={catalogued}"));
    }
    report.detail(format!("media.thumbnails_skipped={}", catalog.skipped));
    if catalog.id_collisions > 0 {
        report.detail(format!("media.id_collisions={}", catalog.id_collisions));
    }

    let correlator = Correlator::new(&cfg.matching);
    let outcome = correlator.correlate(&mut export.days, catalog);
    let stats = outcome.stats;
    report.detail(format!("match.identifier={}", stats.identifier_matches));
    report.detail(format!("match.unresolved_identifiers={}", stats.unresolved_identifiers));
    report.detail(format!("match.proximity={}", stats.proximity_matches));
    report.detail(format!("match.residual={}", stats.residual));
    let with_media = export
        .days
        .messages()
        .filter(|m| !m.matched_media.is_empty())
        .count();
    report.detail(format!("messages.with_media={with_media}"));

    let writer = OutputWriter::new(&paths.output_dir, cfg.output.copy_orphans);
    let written = writer.write_days(&export, &outcome.residual)?;
    report.detail(format!("output.days={}", written.days));
    report.detail(format!("output.conversation_files={}", written.conversation_files));
    report.detail(format!("output.media_copied={}", written.media_copied));
    report.detail(format!(
        "output.orphaned={} output.orphans_copied={}",
        written.orphaned, written.orphans_copied
    ));
    if written.media_missing > 0 {
        report.issue(format!("{} matched media files could not be copied", written.media_missing));
    }

    let avatar_paths = if opts.no_avatars {
        report.detail("avatars=skipped");
        BTreeMap::new()
    } else {
        let (saved, avatar_stats) =
            synthesize_and_save(&cfg.avatars, &export.usernames, &paths.avatar_dir())?;
        report.detail(format!(
            "avatars.fetched={} avatars.fallback={} avatars.workers={}",
            avatar_stats.fetched, avatar_stats.fallback, avatar_stats.workers
        ));
        saved
    };

    let index = build_index(
        &owner,
        &export.usernames,
        &display_names,
        &avatar_paths,
        &export.groups,
    );
    let index_path = write_index(&paths.output_dir, &index)?;
    report.detail(format!("index={}", index_path.display()));

    if cfg.output.keep_work_dir {
        report.detail(format!("work_dir.kept={}", paths.work_dir.display()));
    } else if paths.work_dir.exists() {
        fs::remove_dir_all(&paths.work_dir)
            .with_context(|| format!("failed to remove {}", paths.work_dir.display()))?;
    }

    let matched = catalogued.saturating_sub(stats.residual);
    let ratio = matched as f64 / catalogued.max(1) as f64 * 100.0;
    report.detail(format!("media.matched={matched}/{catalogued} ({ratio:.1}%)"));
    info!(
        elapsed_ms = started.elapsed().as_millis() as u64,
        matched,
        catalogued,
        "split complete"
    );

    drop(lock);
    Ok(report)
}
