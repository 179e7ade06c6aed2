//! Ingestion orchestrator: adapter lookup, parse, one transaction per
//! source batch. A failing source never takes down the rest of a run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;
use vitals_adapters::adapter_for_source;
use vitals_storage::Store;

pub const CRATE_NAME: &str = "vitals-ingest";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    AppleHealth,
    Whoop,
    WhoopFolder,
    Oura,
    OuraFolder,
    Fitbit,
}

impl SourceKind {
    pub fn adapter_tag(self) -> &'static str {
        match self {
            SourceKind::AppleHealth => "apple_health",
            SourceKind::Whoop | SourceKind::WhoopFolder => "whoop",
            SourceKind::Oura | SourceKind::OuraFolder => "oura",
            SourceKind::Fitbit => "fitbit",
        }
    }

    fn is_folder(self) -> bool {
        matches!(self, SourceKind::WhoopFolder | SourceKind::OuraFolder)
    }
}

/// Outcome of one source's ingest: rows attempted per table.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub run_id: String,
    pub counts: BTreeMap<String, usize>,
    pub total: usize,
}

/// Any combination of source exports for one run.
#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub apple: Option<PathBuf>,
    pub whoop: Option<PathBuf>,
    pub whoop_folder: Option<PathBuf>,
    pub oura: Option<PathBuf>,
    pub oura_folder: Option<PathBuf>,
    pub fitbit: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct IngestSummary {
    pub reports: Vec<IngestReport>,
    pub failures: Vec<(String, String)>,
}

impl IngestSummary {
    pub fn total(&self) -> usize {
        self.reports.iter().map(|report| report.total).sum()
    }
}

pub async fn ingest(store: &Store, kind: SourceKind, path: &Path) -> Result<IngestReport> {
    let run_id = Uuid::new_v4().to_string();
    let started = Instant::now();
    let tag = kind.adapter_tag();
    let adapter =
        adapter_for_source(tag).ok_or_else(|| anyhow!("no adapter for source {tag}"))?;

    info!(run_id = %run_id, source = tag, path = %path.display(), "ingest started");
    let mut set = if kind.is_folder() {
        adapter.parse_folder(path)
    } else {
        adapter.parse(path)
    }
    .with_context(|| format!("parsing {tag} export at {}", path.display()))?;

    // An undated sleep row can never be reconciled to a night.
    let before = set.sleep.len();
    set.sleep.retain(|row| !row.recorded_at.is_empty());
    if set.sleep.len() < before {
        warn!(source = tag, dropped = before - set.sleep.len(), "dropped undated sleep rows");
    }

    let counts = store
        .insert_record_set(set)
        .await
        .with_context(|| format!("storing {tag} records"))?;
    let total = counts.values().sum();
    info!(
        run_id = %run_id,
        source = tag,
        total,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "ingest finished"
    );
    Ok(IngestReport { source: tag.to_string(), run_id, counts, total })
}

/// Run every source named in the request; failures are collected, not
/// propagated.
pub async fn ingest_all(store: &Store, request: &IngestRequest) -> IngestSummary {
    let jobs: [(SourceKind, Option<&PathBuf>); 6] = [
        (SourceKind::AppleHealth, request.apple.as_ref()),
        (SourceKind::Whoop, request.whoop.as_ref()),
        (SourceKind::WhoopFolder, request.whoop_folder.as_ref()),
        (SourceKind::Oura, request.oura.as_ref()),
        (SourceKind::OuraFolder, request.oura_folder.as_ref()),
        (SourceKind::Fitbit, request.fitbit.as_ref()),
    ];

    let mut summary = IngestSummary::default();
    for (kind, path) in jobs {
        let Some(path) = path else { continue };
        match ingest(store, kind, path).await {
            Ok(report) => summary.reports.push(report),
            Err(err) => {
                warn!(source = kind.adapter_tag(), err = %format!("{err:#}"), "source failed, continuing");
                summary.failures.push((kind.adapter_tag().to_string(), format!("{err:#}")));
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    const RECOVERY_CSV: &str = "Cycle start time,Recovery score %,Heart rate variability (ms),Resting heart rate (bpm)\n\
                                2024-01-15 08:00:00,67,48.5,52\n\
                                2024-01-16 08:00:00,71,51.0,51\n";

    #[tokio::test]
    async fn whoop_file_lands_in_recovery_and_hrv_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "recovery.csv", RECOVERY_CSV);
        let store = Store::open_in_memory().await.unwrap();

        let report = ingest(&store, SourceKind::Whoop, &path).await.unwrap();
        assert_eq!(report.source, "whoop");
        assert_eq!(report.counts.get("whoop_recovery"), Some(&2));
        assert_eq!(report.counts.get("hrv"), Some(&2));
        assert_eq!(report.total, 4);

        let totals = store.table_counts().await.unwrap();
        assert_eq!(totals.get("whoop_recovery"), Some(&2));
    }

    #[tokio::test]
    async fn reingesting_the_same_file_adds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "recovery.csv", RECOVERY_CSV);
        let store = Store::open_in_memory().await.unwrap();

        ingest(&store, SourceKind::Whoop, &path).await.unwrap();
        ingest(&store, SourceKind::Whoop, &path).await.unwrap();

        let totals = store.table_counts().await.unwrap();
        assert_eq!(totals.get("whoop_recovery"), Some(&2));
        assert_eq!(totals.get("hrv"), Some(&2));
    }

    #[tokio::test]
    async fn one_failing_source_does_not_abort_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_file(&dir, "recovery.csv", RECOVERY_CSV);
        let store = Store::open_in_memory().await.unwrap();

        let request = IngestRequest {
            whoop: Some(good),
            fitbit: Some(dir.path().join("missing.zip")),
            ..Default::default()
        };
        let summary = ingest_all(&store, &request).await;

        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].source, "whoop");
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].0, "fitbit");
        assert_eq!(summary.total(), 4);
    }

    #[tokio::test]
    async fn folder_ingest_merges_every_csv() {
        let dir = tempfile::tempdir().unwrap();
        write_file(&dir, "a_recovery.csv", RECOVERY_CSV);
        write_file(
            &dir,
            "b_strain.csv",
            "Cycle start time,Day Strain,Calories\n2024-01-15 08:00:00,14.2,2450\n",
        );
        let store = Store::open_in_memory().await.unwrap();

        let report = ingest(&store, SourceKind::WhoopFolder, dir.path()).await.unwrap();
        assert_eq!(report.counts.get("whoop_recovery"), Some(&2));
        assert_eq!(report.counts.get("whoop_strain"), Some(&1));
    }
}
