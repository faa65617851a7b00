use std::path::Path;

use anyhow::Result;

use checkin_config::AppConfig;
use checkin_lifecycle::align::SkipReason;
use checkin_lifecycle::journal::RepairJournal;
use checkin_lifecycle::redb_store::RedbStore;
use checkin_lifecycle::schema::id_short;
use checkin_lifecycle::{AlignSummary, AuditReport, LinkResult, RepairOutcome, RepairSummary, Slot};

pub(crate) fn print_created(anchor: &Slot) {
    println!("series created for {}", anchor.series_key());
    println!("  slots planned : {}", anchor.total_slots_planned);
    println!("  frequency     : {}", anchor.frequency.slug());
    println!("  first due     : {}", anchor.due_at);
    println!(
        "  window        : {} .. {}",
        anchor.check_in_window_start, anchor.check_in_window_end
    );
    println!("  slot 1        : {}", anchor.slot_id);
}

pub(crate) fn print_link(result: &LinkResult) {
    if result.replayed {
        println!("already recorded (idempotent replay)");
    }
    println!(
        "slot #{} ({}) completed by response {}",
        result.slot.sequence_number,
        id_short(&result.slot.slot_id),
        result.response.response_id
    );
    println!("  score        : {}", result.response.score);
    println!("  submitted at : {}", result.response.submitted_at);
    if let Some(next) = &result.next_slot {
        println!("  next slot    : #{} due {}", next.sequence_number, next.due_at);
    }
}

pub(crate) fn print_audit(report: &AuditReport) {
    println!("── audit: {} ─────────────────────────────────────", report.scope);
    println!("  slots scanned     : {}", report.slots_scanned);
    println!("  responses scanned : {}", report.responses_scanned);
    println!("  consistent links  : {}", report.consistent_links);
    println!("  findings          : {}", report.findings.len());
    if report.is_clean() {
        println!("  no inconsistencies found");
        return;
    }

    for (series, findings) in report.by_series() {
        println!();
        println!("── {series} ──");
        for finding in findings {
            println!(
                "  [{}] {:<18} slot={} response={}",
                finding.finding_id,
                finding.kind.code(),
                finding.slot_id.as_deref().map(id_short).unwrap_or("-"),
                finding.response_id.as_deref().map(id_short).unwrap_or("-"),
            );
            println!("      {}: {}", finding.reason, finding.detail);
        }
    }
}

pub(crate) fn print_repair(summary: &RepairSummary) {
    let mode = if summary.dry_run { "dry run" } else { "applied" };
    println!("── repair ({mode}): {} ──────────────────────────────", summary.scope);
    println!("  series processed : {}", summary.series_processed);
    for (outcome, count) in &summary.counts {
        println!("  {:<22}: {count}", outcome.slug());
    }

    for action in &summary.actions {
        let verb = action.action.map(|a| a.slug()).unwrap_or("none");
        println!(
            "  {:<22} {:<16} {} slot={} response={}",
            action.outcome.slug(),
            verb,
            action.series,
            action.slot_id.as_deref().map(id_short).unwrap_or("-"),
            action.response_id.as_deref().map(id_short).unwrap_or("-"),
        );
        if !action.note.is_empty() {
            println!("      {}", action.note);
        }
    }

    let manual = summary.count(RepairOutcome::ManualReviewRequired);
    if manual > 0 {
        println!();
        println!("{manual} finding(s) need manual review; nothing was changed for them");
    }
}

pub(crate) fn print_align(summary: &AlignSummary) {
    println!("── align {} ──────────────────────────────────────", summary.client_id);
    for series in &summary.series {
        println!("  {}", series.series);
        if let Some(err) = &series.error {
            println!("    error          : {err}");
            continue;
        }
        if let Some(reference) = series.reference_due_at {
            println!("    reference due  : {reference}");
        }
        println!("    offset (days)  : {}", series.offset_days);
        if series.already_aligned {
            println!("    already aligned");
            continue;
        }
        println!("    shifted        : {}", series.shifted.len());
        let history = series
            .skipped
            .iter()
            .filter(|s| s.reason == SkipReason::CompletedHistory)
            .count();
        println!("    kept (history) : {history}");
        println!("    already moved  : {}", series.skipped.len() - history);
        println!("    anchor written : {}", series.anchor_committed);
        for failure in &series.chunk_failures {
            println!(
                "    chunk {} failed ({} slots): {}",
                failure.chunk,
                failure.slot_ids.len(),
                failure.error
            );
        }
    }
}

pub(crate) fn run_doctor(config_path: &Path, config: &AppConfig) -> Result<()> {
    println!("checkin doctor");
    println!(
        "- config file: {}{}",
        config_path.display(),
        if config_path.exists() { "" } else { " (missing; using defaults)" }
    );
    println!("- timezone: {}", config.schedule.timezone);
    println!("- default due time: {}", config.schedule.default_due_time);
    println!("- materialize: {:?}", config.schedule.materialize);
    println!("- backend: {}", config.storage.backend);
    println!("- batch limit: {}", config.storage.max_batch_ops);

    if config.storage.backend == "redb" {
        let store = RedbStore::open(&config.storage.path, config.storage.max_batch_ops)?;
        let stats = store.stats()?;
        println!("- store path: {}", store.path().display());
        println!("- slots stored: {}", stats.slots);
        println!("- responses stored: {}", stats.responses);
    }

    let journal = RepairJournal::new(&config.repair.journal_path);
    println!("- repair journal: {}", journal.path().display());
    let scan = journal.scan()?;
    println!("- journal records: {}", scan.records.len());
    if !scan.skipped_lines.is_empty() {
        println!("- unreadable journal lines: {:?}", scan.skipped_lines);
    }
    Ok(())
}

pub(crate) fn run_journal(config: &AppConfig, limit: usize, json: bool) -> Result<()> {
    let journal = RepairJournal::new(&config.repair.journal_path);
    let records = journal.load()?;
    let start = records.len().saturating_sub(limit);
    let recent = &records[start..];

    if json {
        println!("{}", serde_json::to_string_pretty(recent)?);
        return Ok(());
    }

    println!("── repair journal ({} of {}) ────────────────────────", recent.len(), records.len());
    if recent.is_empty() {
        println!("  (no repairs recorded)");
    }
    for record in recent {
        println!(
            "  {}  {:<16} {}  finding={}",
            record.recorded_at.format("%Y-%m-%d %H:%M:%S"),
            record.action.slug(),
            record.series,
            record.finding_id,
        );
        for key in record.after_state.keys() {
            println!("      wrote {key}");
        }
    }
    Ok(())
}
