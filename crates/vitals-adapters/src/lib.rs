//! Format adapters: one per source ecosystem, all emitting the canonical
//! record set. Record-level malformations are skipped; container-level
//! failures (unreadable archive, missing payload) surface as errors.

pub mod apple;
pub mod fitbit;
pub mod oura;
pub mod whoop;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use thiserror::Error;
use tracing::warn;
use vitals_core::RecordSet;

pub const CRATE_NAME: &str = "vitals-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unreadable archive {}: {source}", path.display())]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("no {0} found in archive")]
    MissingPayload(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed xml: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed csv: {0}")]
    Csv(#[from] csv::Error),
}

/// A stateless parser from one vendor's export format into canonical records.
pub trait SourceAdapter: Send + Sync {
    fn source_name(&self) -> &'static str;

    fn parse(&self, path: &Path) -> Result<RecordSet, AdapterError>;

    /// Extension of the per-file exports this adapter accepts in a folder.
    fn folder_extension(&self) -> &'static str {
        "csv"
    }

    /// Parse every matching file in a folder, merging the results. Files
    /// that fail to parse are skipped so one stray file cannot sink a batch.
    fn parse_folder(&self, dir: &Path) -> Result<RecordSet, AdapterError> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(self.folder_extension()))
            })
            .collect();
        paths.sort();

        let mut merged = RecordSet::default();
        for path in paths {
            match self.parse(&path) {
                Ok(set) => merged.merge(set),
                Err(err) => {
                    warn!(source = self.source_name(), path = %path.display(), %err, "skipping unparseable file");
                }
            }
        }
        Ok(merged)
    }
}

/// Look up an adapter by its canonical source tag.
pub fn adapter_for_source(kind: &str) -> Option<Box<dyn SourceAdapter>> {
    match kind {
        "apple_health" => Some(Box::new(apple::AppleHealthAdapter)),
        "whoop" => Some(Box::new(whoop::WhoopAdapter)),
        "oura" => Some(Box::new(oura::OuraAdapter)),
        "fitbit" => Some(Box::new(fitbit::FitbitAdapter)),
        _ => None,
    }
}

/// Normalize a CSV header for alias matching: lowercase, spaces to
/// underscores, parenthesized units removed, `%` to `pct`, `/` to `_per_`.
pub(crate) fn normalize_header(raw: &str) -> String {
    raw.to_lowercase()
        .trim()
        .replace(' ', "_")
        .replace(['(', ')'], "")
        .replace('%', "pct")
        .replace('/', "_per_")
}

/// Resolve a semantic field by probing an ordered list of header aliases,
/// returning the first parseable number. Preserves legitimate zeroes.
pub(crate) fn coalesce_f64(row: &HashMap<String, String>, aliases: &[&str]) -> Option<f64> {
    aliases.iter().find_map(|key| parse_f64(row.get(*key)?))
}

pub(crate) fn coalesce_str(row: &HashMap<String, String>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|key| {
        let value = row.get(*key)?.trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

pub(crate) fn parse_f64(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok()
}

/// Duration fields that vendors report as either hours or minutes,
/// normalized to hours.
pub(crate) fn hours_from_hours_or_minutes(
    hours: Option<f64>,
    minutes: Option<f64>,
) -> Option<f64> {
    hours.or_else(|| minutes.map(|m| vitals_core::round_to(m / 60.0, 3)))
}

pub(crate) fn seconds_to_hours(seconds: Option<f64>) -> Option<f64> {
    seconds.map(|s| vitals_core::round_to(s / 3600.0, 3))
}

/// Normalize a vendor timestamp to `YYYY-MM-DDTHH:MM:SS` local time by
/// trying the given formats in order. Offsets are dropped, keeping the wall
/// clock. Unrecognized strings pass through trimmed rather than being lost.
pub(crate) fn normalize_timestamp(raw: &str, formats: &[&str]) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    for fmt in formats {
        if fmt.ends_with('z') {
            if let Ok(dt) = DateTime::parse_from_str(trimmed, fmt) {
                return dt.naive_local().format("%Y-%m-%dT%H:%M:%S").to_string();
            }
        } else if fmt.contains("%H") {
            if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
                return dt.format("%Y-%m-%dT%H:%M:%S").to_string();
            }
        } else if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return format!("{}T00:00:00", date.format("%Y-%m-%d"));
        }
    }
    trimmed.to_string()
}

/// Read a CSV file into normalized-header row maps. Unreadable rows are
/// dropped; a BOM on the first header is stripped.
pub(crate) fn read_csv_rows(
    path: &Path,
) -> Result<(Vec<String>, Vec<HashMap<String, String>>), AdapterError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| normalize_header(h.trim_start_matches('\u{feff}')))
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let Ok(record) = record else {
            continue;
        };
        let mut row = HashMap::with_capacity(headers.len());
        for (index, field) in record.iter().enumerate() {
            if let Some(header) = headers.get(index) {
                row.insert(header.clone(), field.trim().to_string());
            }
        }
        rows.push(row);
    }
    Ok((headers, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_normalization_handles_units_and_symbols() {
        assert_eq!(normalize_header("Recovery score %"), "recovery_score_pct");
        assert_eq!(normalize_header("Heart rate variability (ms)"), "heart_rate_variability_ms");
        assert_eq!(normalize_header("Energy burned (cal/hr)"), "energy_burned_cal_per_hr");
    }

    #[test]
    fn coalesce_takes_first_parseable_alias() {
        let mut row = HashMap::new();
        row.insert("hrv".to_string(), "48.5".to_string());
        row.insert("hrv_ms".to_string(), String::new());
        assert_eq!(coalesce_f64(&row, &["hrv_ms", "hrv"]), Some(48.5));
        assert_eq!(coalesce_f64(&row, &["absent"]), None);
    }

    #[test]
    fn coalesce_preserves_zero() {
        let mut row = HashMap::new();
        row.insert("disturbances".to_string(), "0".to_string());
        assert_eq!(coalesce_f64(&row, &["disturbances"]), Some(0.0));
    }

    #[test]
    fn timestamps_normalize_across_vendor_formats() {
        let formats = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"];
        assert_eq!(
            normalize_timestamp("2024-01-15 08:23:44 -0500", formats),
            "2024-01-15T08:23:44"
        );
        assert_eq!(normalize_timestamp("2024-01-15", formats), "2024-01-15T00:00:00");
        assert_eq!(normalize_timestamp("", formats), "");
    }

    #[test]
    fn registry_knows_every_source() {
        for kind in ["apple_health", "whoop", "oura", "fitbit"] {
            let adapter = adapter_for_source(kind).expect("registered adapter");
            assert_eq!(adapter.source_name(), kind);
        }
        assert!(adapter_for_source("garmin").is_none());
    }
}
