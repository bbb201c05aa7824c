//! Per-run report directories: the run summary as JSON plus Parquet snapshots of the
//! derived tables for the run's window.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use ledgr_core::{CoverageRecord, ProfitSummary};
use ledgr_storage::{scan_typed, tables, LedgerStore};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::backfill::BackfillReport;
use crate::orchestrator::SyncRunSummary;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `reports/<run_id>/` for a finished run and return that directory.
pub async fn write_run_report(
    reports_root: &Path,
    store: &dyn LedgerStore,
    summary: &SyncRunSummary,
) -> Result<PathBuf> {
    let run_dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("run_summary.json"), json)
        .await
        .context("writing run_summary.json")?;

    if summary.ok {
        export_snapshots(&run_dir, store, summary).await?;
    }
    Ok(run_dir)
}

/// Backfills keep one directory named after the first chunk's run.
pub async fn write_backfill_report(reports_root: &Path, report: &BackfillReport) -> Result<Option<PathBuf>> {
    let Some(first) = report.chunks.first() else {
        return Ok(None);
    };
    let run_dir = reports_root.join(format!("backfill-{}", first.summary.run_id));
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let json = serde_json::to_vec_pretty(report).context("serializing backfill report")?;
    fs::write(run_dir.join("backfill_summary.json"), json)
        .await
        .context("writing backfill_summary.json")?;
    Ok(Some(run_dir))
}

async fn export_snapshots(
    run_dir: &Path,
    store: &dyn LedgerStore,
    summary: &SyncRunSummary,
) -> Result<PathBuf> {
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let profit: Vec<ProfitSummary> = scan_typed(
        store,
        &tables::PROFIT_DAILY,
        &summary.client_id,
        Some(&summary.window),
    )
    .await
    .context("reading profit_daily for snapshot")?;
    let coverage: Vec<CoverageRecord> = scan_typed(
        store,
        &tables::COVERAGE_DAILY,
        &summary.client_id,
        Some(&summary.window),
    )
    .await
    .context("reading coverage_daily for snapshot")?;

    let profit_path = snapshot_dir.join("profit_daily.parquet");
    let coverage_path = snapshot_dir.join("coverage_daily.parquet");
    write_parquet(&profit_path, profit_batch(&profit)?)?;
    write_parquet(&coverage_path, coverage_batch(&coverage)?)?;

    let manifest = SnapshotManifest {
        schema_version: SNAPSHOT_SCHEMA_VERSION,
        files: vec![
            manifest_entry("profit_daily", run_dir, &profit_path)?,
            manifest_entry("coverage_daily", run_dir, &coverage_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing {}", path.display()))?;
    Ok(())
}

fn utf8<'a>(values: impl Iterator<Item = &'a str>) -> ArrayRef {
    Arc::new(StringArray::from(values.map(Some).collect::<Vec<_>>()))
}

fn float(values: impl Iterator<Item = f64>) -> ArrayRef {
    Arc::new(Float64Array::from(values.collect::<Vec<_>>()))
}

fn int(values: impl Iterator<Item = i64>) -> ArrayRef {
    Arc::new(Int64Array::from(values.collect::<Vec<_>>()))
}

fn profit_batch(rows: &[ProfitSummary]) -> Result<RecordBatch> {
    let money = |name: &str| ArrowField::new(name, DataType::Float64, false);
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        money("revenue"),
        ArrowField::new("orders", DataType::Int64, false),
        ArrowField::new("units", DataType::Int64, false),
        money("paid_spend"),
        money("cogs"),
        money("processing_fees"),
        money("variable_costs"),
        money("fixed_costs"),
        money("contribution_profit"),
        money("spend_efficiency"),
        money("profit_efficiency"),
        money("coverage"),
        ArrowField::new("mode", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Utf8, false),
    ]));

    let dates: Vec<String> = rows.iter().map(|r| r.date.to_string()).collect();
    RecordBatch::try_new(
        schema,
        vec![
            utf8(rows.iter().map(|r| r.client_id.as_str())),
            utf8(dates.iter().map(String::as_str)),
            float(rows.iter().map(|r| r.revenue)),
            int(rows.iter().map(|r| r.orders)),
            int(rows.iter().map(|r| r.units)),
            float(rows.iter().map(|r| r.paid_spend)),
            float(rows.iter().map(|r| r.cogs)),
            float(rows.iter().map(|r| r.processing_fees)),
            float(rows.iter().map(|r| r.variable_costs)),
            float(rows.iter().map(|r| r.fixed_costs)),
            float(rows.iter().map(|r| r.contribution_profit)),
            float(rows.iter().map(|r| r.spend_efficiency)),
            float(rows.iter().map(|r| r.profit_efficiency)),
            float(rows.iter().map(|r| r.coverage)),
            utf8(rows.iter().map(|r| r.mode.as_str())),
            utf8(rows.iter().map(|r| r.confidence.as_str())),
        ],
    )
    .context("building profit_daily record batch")
}

fn coverage_batch(rows: &[CoverageRecord]) -> Result<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("client_id", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("product_cogs_known", DataType::Float64, false),
        ArrowField::new("revenue_with_cogs", DataType::Float64, false),
        ArrowField::new("units_with_cogs", DataType::Int64, false),
        ArrowField::new("estimated_cogs_missing", DataType::Float64, false),
    ]));

    let dates: Vec<String> = rows.iter().map(|r| r.date.to_string()).collect();
    RecordBatch::try_new(
        schema,
        vec![
            utf8(rows.iter().map(|r| r.client_id.as_str())),
            utf8(dates.iter().map(String::as_str)),
            float(rows.iter().map(|r| r.product_cogs_known)),
            float(rows.iter().map(|r| r.revenue_with_cogs)),
            int(rows.iter().map(|r| r.units_with_cogs)),
            float(rows.iter().map(|r| r.estimated_cogs_missing)),
        ],
    )
    .context("building coverage_daily record batch")
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(run_dir).unwrap_or(path).display().to_string();
    Ok(SnapshotFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

/// Markdown digest of the newest `runs` report directories under `reports_root`.
pub fn report_recent_markdown(runs: usize, reports_root: &Path) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join("run_summary.json").exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Ledger sync runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join("run_summary.json");
        let summary: SyncRunSummary = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        lines.push(format!("## Run `{}`", summary.run_id));
        lines.push(format!("- client: {}", summary.client_id));
        lines.push(format!("- window: {}", summary.window));
        lines.push(format!(
            "- result: {} (status {})",
            if summary.ok { "ok" } else { "failed" },
            summary.status
        ));
        for step in &summary.steps {
            let mut line = format!("  - {}: {} ({})", step.step, step.status, step.count);
            if let Some(err) = &step.error {
                line.push_str(&format!(" {err}"));
            }
            lines.push(line);
        }
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
