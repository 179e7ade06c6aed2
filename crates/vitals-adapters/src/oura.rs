//! Oura CSV adapter. Duration columns arrive in seconds and are normalized
//! to hours; readiness rows also feed the hrv and heart_rate tables.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;
use vitals_core::{normalize_pct, MetricSample, ReadinessRow, RecordSet, SleepRow};

use crate::{
    coalesce_f64, coalesce_str, normalize_timestamp, read_csv_rows, seconds_to_hours,
    AdapterError, SourceAdapter,
};

const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%:z",
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d",
];

const DATE_ALIASES: &[&str] = &["date", "day", "summary_date"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsvKind {
    Readiness,
    Sleep,
    Activity,
    Unknown,
}

fn detect_kind(headers: &[String]) -> CsvKind {
    let joined = headers.join(" ");
    if joined.contains("readiness") || joined.contains("recovery_index") {
        CsvKind::Readiness
    } else if joined.contains("bedtime") || joined.contains("deep_sleep") || joined.contains("sleep_score") {
        CsvKind::Sleep
    } else if joined.contains("steps") || joined.contains("activity_score") || joined.contains("active_calories") {
        CsvKind::Activity
    } else {
        CsvKind::Unknown
    }
}

pub struct OuraAdapter;

impl SourceAdapter for OuraAdapter {
    fn source_name(&self) -> &'static str {
        "oura"
    }

    fn parse(&self, path: &Path) -> Result<RecordSet, AdapterError> {
        let (headers, rows) = read_csv_rows(path)?;
        let mut set = RecordSet::default();
        match detect_kind(&headers) {
            CsvKind::Readiness => {
                for row in &rows {
                    let Some(readiness) = parse_readiness_row(row) else {
                        continue;
                    };
                    if let Some(hrv) = readiness.hrv_balance.filter(|v| *v > 0.0) {
                        set.hrv.push(metric_sample("hrv_rmssd", hrv, "ms", &readiness.recorded_at));
                    }
                    if let Some(rhr) = readiness.resting_heart_rate.filter(|v| *v > 0.0) {
                        set.heart_rate.push(metric_sample(
                            "resting_heart_rate",
                            rhr,
                            "count/min",
                            &readiness.recorded_at,
                        ));
                    }
                    set.oura_readiness.push(readiness);
                }
            }
            CsvKind::Sleep => {
                for row in &rows {
                    parse_sleep_row(row, &mut set);
                }
            }
            // Steps/activity-score exports are recognized but have no
            // destination table yet.
            CsvKind::Activity => {}
            CsvKind::Unknown => {
                warn!(path = %path.display(), "unrecognized csv fingerprint, emitting nothing");
            }
        }
        Ok(set)
    }
}

fn metric_sample(metric: &str, value: f64, unit: &str, recorded_at: &str) -> MetricSample {
    MetricSample {
        source: "oura".into(),
        metric: metric.into(),
        value,
        unit: unit.into(),
        recorded_at: recorded_at.into(),
        device: Some("oura".into()),
    }
}

fn parse_readiness_row(row: &HashMap<String, String>) -> Option<ReadinessRow> {
    let raw_date = coalesce_str(row, DATE_ALIASES)?;
    Some(ReadinessRow {
        source: "oura".into(),
        recorded_at: normalize_timestamp(&raw_date, TIME_FORMATS),
        readiness_score: coalesce_f64(row, &["readiness_score", "score", "readiness"]),
        hrv_balance: coalesce_f64(row, &["hrv_balance", "hrv", "average_hrv"]),
        resting_heart_rate: coalesce_f64(row, &["resting_heart_rate", "rhr", "heart_rate"]),
        temperature_deviation: coalesce_f64(
            row,
            &["temperature_deviation", "temperature", "skin_temp_deviation"],
        ),
        recovery_index: coalesce_f64(row, &["recovery_index"]),
        activity_balance: coalesce_f64(row, &["activity_balance"]),
        sleep_balance: coalesce_f64(row, &["sleep_balance"]),
    })
}

fn parse_sleep_row(row: &HashMap<String, String>, set: &mut RecordSet) {
    let Some(raw_date) = coalesce_str(row, DATE_ALIASES) else {
        return;
    };
    let recorded_at = normalize_timestamp(&raw_date, TIME_FORMATS);

    let start = coalesce_str(row, &["bedtime_start", "sleep_start"])
        .map(|s| normalize_timestamp(&s, TIME_FORMATS));
    let end = coalesce_str(row, &["bedtime_end", "sleep_end"])
        .map(|s| normalize_timestamp(&s, TIME_FORMATS));

    set.sleep.push(SleepRow {
        source: "oura".into(),
        stage: Some("asleep".into()),
        start,
        end,
        recorded_at: recorded_at.clone(),
        device: Some("oura".into()),
        sleep_performance_pct: coalesce_f64(row, &["efficiency", "sleep_efficiency"])
            .map(normalize_pct),
        time_in_bed_hours: seconds_to_hours(coalesce_f64(row, &["time_in_bed", "total_bedtime"])),
        light_sleep_hours: seconds_to_hours(coalesce_f64(
            row,
            &["light_sleep_duration", "light", "light_sleep"],
        )),
        rem_sleep_hours: seconds_to_hours(coalesce_f64(
            row,
            &["rem_sleep_duration", "rem", "rem_sleep"],
        )),
        deep_sleep_hours: seconds_to_hours(coalesce_f64(
            row,
            &["deep_sleep_duration", "deep", "deep_sleep"],
        )),
        awake_hours: seconds_to_hours(coalesce_f64(
            row,
            &["awake_duration", "awake_time", "awake"],
        )),
        disturbances: coalesce_f64(row, &["restless_periods", "disturbances"]),
    });

    // Lowest overnight heart rate stands in for resting HR.
    if let Some(rhr) = coalesce_f64(row, &["hr_lowest", "lowest_heart_rate"]).filter(|v| *v > 0.0) {
        set.heart_rate
            .push(metric_sample("resting_heart_rate", rhr, "count/min", &recorded_at));
    }
    if let Some(hrv) =
        coalesce_f64(row, &["average_hrv", "hrv_average", "hrv"]).filter(|v| *v > 0.0)
    {
        set.hrv.push(metric_sample("hrv_rmssd", hrv, "ms", &recorded_at));
    }
}
