//! Whoop CSV adapter. One export is several same-shaped CSVs (recovery,
//! strain, sleep); the kind is detected from the header fingerprint.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;
use vitals_core::{normalize_pct, MetricSample, RecordSet, RecoveryRow, SleepRow, StrainRow};

use crate::{
    coalesce_f64, coalesce_str, hours_from_hours_or_minutes, normalize_timestamp, read_csv_rows,
    AdapterError, SourceAdapter,
};

const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%Y",
    "%Y-%m-%d",
];

const DATE_ALIASES: &[&str] = &["cycle_start_time", "date", "start_time"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CsvKind {
    Recovery,
    Strain,
    Sleep,
    Unknown,
}

fn detect_kind(headers: &[String]) -> CsvKind {
    let joined = headers.join(" ");
    if joined.contains("recovery_score") {
        CsvKind::Recovery
    } else if joined.contains("strain") && joined.contains("calories") {
        CsvKind::Strain
    } else if joined.contains("sleep_performance") {
        CsvKind::Sleep
    } else if joined.contains("hrv") && joined.contains("rhr") {
        // HRV travels in the recovery CSV.
        CsvKind::Recovery
    } else {
        CsvKind::Unknown
    }
}

pub struct WhoopAdapter;

impl SourceAdapter for WhoopAdapter {
    fn source_name(&self) -> &'static str {
        "whoop"
    }

    fn parse(&self, path: &Path) -> Result<RecordSet, AdapterError> {
        let (headers, rows) = read_csv_rows(path)?;
        let mut set = RecordSet::default();
        match detect_kind(&headers) {
            CsvKind::Recovery => {
                for row in &rows {
                    let Some(recovery) = parse_recovery_row(row) else {
                        continue;
                    };
                    if let Some(hrv_ms) = recovery.hrv_ms {
                        set.hrv.push(MetricSample {
                            source: "whoop".into(),
                            metric: "hrv_sdnn".into(),
                            value: hrv_ms,
                            unit: "ms".into(),
                            recorded_at: recovery.recorded_at.clone(),
                            device: Some("whoop".into()),
                        });
                    }
                    set.whoop_recovery.push(recovery);
                }
            }
            CsvKind::Strain => {
                set.whoop_strain.extend(rows.iter().filter_map(parse_strain_row));
            }
            CsvKind::Sleep => {
                set.sleep.extend(rows.iter().filter_map(parse_sleep_row));
            }
            CsvKind::Unknown => {
                warn!(path = %path.display(), "unrecognized csv fingerprint, emitting nothing");
            }
        }
        Ok(set)
    }
}

fn row_timestamp(row: &HashMap<String, String>, aliases: &[&str]) -> Option<String> {
    let raw = coalesce_str(row, aliases)?;
    Some(normalize_timestamp(&raw, TIME_FORMATS))
}

fn parse_recovery_row(row: &HashMap<String, String>) -> Option<RecoveryRow> {
    let recorded_at = row_timestamp(row, DATE_ALIASES)?;
    Some(RecoveryRow {
        source: "whoop".into(),
        recorded_at,
        recovery_score: coalesce_f64(row, &["recovery_score_pct", "recovery_score", "recovery"]),
        hrv_ms: coalesce_f64(row, &["heart_rate_variability_ms", "hrv_ms", "hrv"]),
        resting_heart_rate: coalesce_f64(row, &["resting_heart_rate_bpm", "rhr_bpm", "rhr"]),
        spo2_pct: coalesce_f64(row, &["spo2_pct", "blood_oxygen_pct", "spo2"]),
        skin_temp_celsius: coalesce_f64(row, &["skin_temp_celsius", "skin_temp"]),
    })
}

fn parse_strain_row(row: &HashMap<String, String>) -> Option<StrainRow> {
    let recorded_at = row_timestamp(row, DATE_ALIASES)?;
    Some(StrainRow {
        source: "whoop".into(),
        recorded_at,
        day_strain: coalesce_f64(row, &["day_strain", "strain"]),
        calories: coalesce_f64(row, &["calories", "active_calories"]),
        max_heart_rate: coalesce_f64(row, &["max_heart_rate_bpm", "max_hr"]),
        avg_heart_rate: coalesce_f64(row, &["average_heart_rate_bpm", "avg_hr"]),
    })
}

fn parse_sleep_row(row: &HashMap<String, String>) -> Option<SleepRow> {
    let recorded_at = row_timestamp(row, &["cycle_start_time", "sleep_onset", "date"])?;
    Some(SleepRow {
        source: "whoop".into(),
        stage: Some("asleep".into()),
        recorded_at,
        sleep_performance_pct: coalesce_f64(row, &["sleep_performance_pct", "sleep_performance"])
            .map(normalize_pct),
        time_in_bed_hours: hours_from_hours_or_minutes(
            coalesce_f64(row, &["time_in_bed_hours"]),
            coalesce_f64(
                row,
                &["total_in_bed_min_min", "total_in_bed_min", "total_in_bed_minutes"],
            ),
        ),
        light_sleep_hours: hours_from_hours_or_minutes(
            coalesce_f64(row, &["light_sleep_duration_hours"]),
            coalesce_f64(row, &["light_sleep_min"]),
        ),
        rem_sleep_hours: hours_from_hours_or_minutes(
            coalesce_f64(row, &["rem_sleep_duration_hours"]),
            coalesce_f64(row, &["rem_sleep_min"]),
        ),
        deep_sleep_hours: hours_from_hours_or_minutes(
            coalesce_f64(row, &["slow_wave_sleep_duration_hours"]),
            coalesce_f64(row, &["slow_wave_sleep_min", "sws_min"]),
        ),
        awake_hours: hours_from_hours_or_minutes(
            coalesce_f64(row, &["awake_duration_hours"]),
            coalesce_f64(row, &["awake_min"]),
        ),
        disturbances: coalesce_f64(row, &["disturbances"]),
        ..SleepRow::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn recovery_csv_yields_scores_and_hrv_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "recovery.csv",
            "Cycle start time,Recovery score %,Heart rate variability (ms),Resting heart rate (bpm),Skin temp (celsius)\n\
             2024-01-15 08:23:44,67,48.5,52,33.9\n\
             ,90,50,51,34.0\n",
        );
        let set = WhoopAdapter.parse(&path).unwrap();
        assert_eq!(set.whoop_recovery.len(), 1);
        let rec = &set.whoop_recovery[0];
        assert_eq!(rec.recorded_at, "2024-01-15T08:23:44");
        assert_eq!(rec.recovery_score, Some(67.0));
        assert_eq!(set.hrv.len(), 1);
        assert_eq!(set.hrv[0].metric, "hrv_sdnn");
        assert_eq!(set.hrv[0].value, 48.5);
    }

    #[test]
    fn sleep_csv_scales_fractional_performance_and_minute_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "sleep.csv",
            "Cycle start time,Sleep performance %,Light sleep (min),REM sleep (min),Slow wave sleep (min),Awake (min)\n\
             2024-01-15 23:10:00,0.87,210,90,60,30\n",
        );
        let set = WhoopAdapter.parse(&path).unwrap();
        assert_eq!(set.sleep.len(), 1);
        let row = &set.sleep[0];
        assert_eq!(row.sleep_performance_pct, Some(87.0));
        assert_eq!(row.light_sleep_hours, Some(3.5));
        assert_eq!(row.deep_sleep_hours, Some(1.0));
        assert_eq!(row.stage.as_deref(), Some("asleep"));
    }

    #[test]
    fn already_scaled_performance_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "sleep.csv",
            "Cycle start time,Sleep performance %\n2024-01-15 23:10:00,87\n",
        );
        let set = WhoopAdapter.parse(&path).unwrap();
        assert_eq!(set.sleep[0].sleep_performance_pct, Some(87.0));
    }

    #[test]
    fn unknown_fingerprint_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "other.csv", "foo,bar\n1,2\n");
        let set = WhoopAdapter.parse(&path).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn strain_csv_detected_by_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(
            &dir,
            "strain.csv",
            "Cycle start time,Day Strain,Calories,Max heart rate (bpm),Average heart rate (bpm)\n\
             01/15/2024,14.2,2450,171,74\n",
        );
        let set = WhoopAdapter.parse(&path).unwrap();
        assert_eq!(set.whoop_strain.len(), 1);
        assert_eq!(set.whoop_strain[0].recorded_at, "2024-01-15T00:00:00");
        assert_eq!(set.whoop_strain[0].day_strain, Some(14.2));
    }

    #[test]
    fn folder_parse_merges_and_skips_unknown() {
        let dir = tempfile::tempdir().unwrap();
        write_csv(
            &dir,
            "a_recovery.csv",
            "Cycle start time,Recovery score %,Heart rate variability (ms)\n2024-01-15 08:00:00,67,48\n",
        );
        write_csv(
            &dir,
            "b_strain.csv",
            "Cycle start time,Day Strain,Calories\n2024-01-15 08:00:00,12.0,2000\n",
        );
        write_csv(&dir, "c_other.csv", "foo,bar\n1,2\n");
        let set = WhoopAdapter.parse_folder(dir.path()).unwrap();
        assert_eq!(set.whoop_recovery.len(), 1);
        assert_eq!(set.whoop_strain.len(), 1);
    }
}
