//! Fitbit takeout adapter. The export is a zip of JSON arrays; files are
//! classified by basename, and anything malformed is skipped per file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde_json::Value;
use tracing::warn;
use vitals_core::{miles_to_km, round_to, MetricSample, RecordSet, SleepRow, WorkoutRow};

use crate::{normalize_timestamp, AdapterError, SourceAdapter};

const TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%m/%d/%y %H:%M:%S",
    "%Y-%m-%d",
];

const SOURCE: &str = "fitbit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Heart,
    Sleep,
    Hrv,
    Exercise,
    Other,
}

fn classify(basename: &str) -> FileKind {
    if basename.starts_with("activities-heart") && !basename.contains("intraday") {
        FileKind::Heart
    } else if prefixed_year(basename, "sleep") {
        FileKind::Sleep
    } else if prefixed_year(basename, "hrv") {
        FileKind::Hrv
    } else if prefixed_year(basename, "exercise") {
        FileKind::Exercise
    } else {
        FileKind::Other
    }
}

/// `sleep-2024-01-01.json` style names: prefix, separator, four-digit year.
fn prefixed_year(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix(['-', '_']))
        .is_some_and(|rest| {
            rest.len() >= 4 && rest.as_bytes()[..4].iter().all(|b| b.is_ascii_digit())
        })
}

pub struct FitbitAdapter;

impl SourceAdapter for FitbitAdapter {
    fn source_name(&self) -> &'static str {
        SOURCE
    }

    fn parse(&self, path: &Path) -> Result<RecordSet, AdapterError> {
        let file = File::open(path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|source| AdapterError::Archive {
            path: path.to_path_buf(),
            source,
        })?;

        let names: Vec<String> = archive.file_names().map(str::to_string).collect();
        let mut set = RecordSet::default();
        for name in &names {
            if name.starts_with("__MACOSX") || !name.to_lowercase().ends_with(".json") {
                continue;
            }
            let basename = name.rsplit('/').next().unwrap_or(name).to_lowercase();
            let kind = classify(&basename);
            if kind == FileKind::Other {
                continue;
            }

            let mut raw = String::new();
            match archive.by_name(name) {
                Ok(mut entry) => {
                    if let Err(err) = entry.read_to_string(&mut raw) {
                        warn!(entry = %name, %err, "skipping unreadable takeout file");
                        continue;
                    }
                }
                Err(err) => {
                    warn!(entry = %name, %err, "skipping unreadable takeout file");
                    continue;
                }
            }
            let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(&raw) else {
                warn!(entry = %name, "skipping non-array takeout file");
                continue;
            };

            match kind {
                FileKind::Heart => parse_heart(&entries, &mut set),
                FileKind::Sleep => parse_sleep(&entries, &mut set),
                FileKind::Hrv => parse_hrv(&entries, &mut set),
                FileKind::Exercise => parse_exercise(&entries, &mut set),
                FileKind::Other => {}
            }
        }
        Ok(set)
    }
}

fn parse_heart(entries: &[Value], set: &mut RecordSet) {
    for entry in entries {
        let Some(date) = entry.get("dateTime").and_then(Value::as_str) else {
            continue;
        };
        let Some(rhr) = entry
            .get("value")
            .and_then(|v| v.get("restingHeartRate"))
            .and_then(Value::as_f64)
        else {
            continue;
        };
        set.heart_rate.push(sample("resting_heart_rate", rhr, "count/min", date));
    }
}

fn parse_hrv(entries: &[Value], set: &mut RecordSet) {
    for entry in entries {
        let daily = entry.get("hrv").and_then(Value::as_array);
        let Some(daily) = daily else { continue };
        for day in daily {
            let Some(date) = day.get("dateTime").and_then(Value::as_str) else {
                continue;
            };
            let Some(rmssd) = day
                .get("value")
                .and_then(|v| v.get("dailyRmssd"))
                .and_then(Value::as_f64)
            else {
                continue;
            };
            set.hrv.push(sample("hrv_rmssd", round_to(rmssd, 2), "ms", date));
        }
    }
}

fn parse_sleep(entries: &[Value], set: &mut RecordSet) {
    for entry in entries {
        let Some(date) = entry.get("dateOfSleep").and_then(Value::as_str) else {
            continue;
        };
        let summary = entry.pointer("/levels/summary");
        let awake_minutes = summary
            .and_then(|s| s.pointer("/wake/minutes"))
            .and_then(Value::as_f64)
            .or_else(|| entry.get("minutesAwake").and_then(Value::as_f64));

        set.sleep.push(SleepRow {
            source: SOURCE.into(),
            stage: Some("asleep".into()),
            start: entry
                .get("startTime")
                .and_then(Value::as_str)
                .map(|s| normalize_timestamp(s, TIME_FORMATS)),
            end: entry
                .get("endTime")
                .and_then(Value::as_str)
                .map(|s| normalize_timestamp(s, TIME_FORMATS)),
            recorded_at: normalize_timestamp(date, TIME_FORMATS),
            device: Some(SOURCE.into()),
            sleep_performance_pct: entry.get("efficiency").and_then(Value::as_f64),
            time_in_bed_hours: minutes_to_hours(entry.get("timeInBed").and_then(Value::as_f64)),
            light_sleep_hours: stage_hours(summary, "light"),
            rem_sleep_hours: stage_hours(summary, "rem"),
            deep_sleep_hours: stage_hours(summary, "deep"),
            awake_hours: minutes_to_hours(awake_minutes),
            disturbances: None,
        });
    }
}

fn parse_exercise(entries: &[Value], set: &mut RecordSet) {
    for entry in entries {
        let Some(start) = entry.get("startTime").and_then(Value::as_str) else {
            continue;
        };
        let duration_ms = entry
            .get("activeDuration")
            .and_then(Value::as_f64)
            .or_else(|| entry.get("duration").and_then(Value::as_f64));
        let distance_km = entry.get("distance").and_then(Value::as_f64).and_then(|raw| {
            let unit = entry
                .get("distanceUnit")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_lowercase();
            match unit.as_str() {
                "mile" | "miles" => Some(miles_to_km(raw)),
                "kilometer" | "kilometers" | "km" => Some(round_to(raw, 3)),
                _ => None,
            }
        });
        let activity = entry
            .get("activityName")
            .and_then(Value::as_str)
            .unwrap_or("unknown");

        set.workouts.push(WorkoutRow {
            source: SOURCE.into(),
            activity: activity_name(activity),
            duration_minutes: duration_ms.map(|ms| round_to(ms / 60000.0, 2)),
            distance_km,
            calories: entry
                .get("calories")
                .and_then(Value::as_f64)
                .map(|c| round_to(c, 1)),
            recorded_at: normalize_timestamp(start, TIME_FORMATS),
            end: None,
            device: Some(SOURCE.into()),
        });
    }
}

fn sample(metric: &str, value: f64, unit: &str, date: &str) -> MetricSample {
    MetricSample {
        source: SOURCE.into(),
        metric: metric.into(),
        value,
        unit: unit.into(),
        recorded_at: normalize_timestamp(date, TIME_FORMATS),
        device: Some(SOURCE.into()),
    }
}

fn stage_hours(summary: Option<&Value>, stage: &str) -> Option<f64> {
    minutes_to_hours(
        summary?
            .get(stage)
            .and_then(|s| s.get("minutes"))
            .and_then(Value::as_f64),
    )
}

fn minutes_to_hours(minutes: Option<f64>) -> Option<f64> {
    minutes.map(|m| round_to(m / 60.0, 3))
}

fn activity_name(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    const MAP: &[(&str, &str)] = &[
        ("run", "running"),
        ("walk", "walking"),
        ("hike", "walking"),
        ("bike", "cycling"),
        ("cycling", "cycling"),
        ("swim", "swimming"),
        ("yoga", "yoga"),
        ("pilates", "yoga"),
        ("weight", "strength_training"),
        ("strength", "strength_training"),
        ("circuit", "hiit"),
        ("interval", "hiit"),
        ("hiit", "hiit"),
        ("sport", "hiit"),
    ];
    for (needle, name) in MAP {
        if lowered.contains(needle) {
            return (*name).to_string();
        }
    }
    lowered.replace(' ', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("takeout.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        (dir, path)
    }

    #[test]
    fn heart_and_hrv_files_yield_daily_samples() {
        let heart = r#"[{"dateTime":"2024-01-15","value":{"restingHeartRate":55}}]"#;
        let hrv = r#"[{"hrv":[{"value":{"dailyRmssd":34.567},"dateTime":"2024-01-15"}]}]"#;
        let (_dir, path) = build_zip(&[
            ("Physical Activity/activities-heart-2024-01-01.json", heart),
            ("Sleep/hrv-2024-01-01.json", hrv),
        ]);
        let set = FitbitAdapter.parse(&path).unwrap();

        assert_eq!(set.heart_rate.len(), 1);
        assert_eq!(set.heart_rate[0].metric, "resting_heart_rate");
        assert_eq!(set.heart_rate[0].recorded_at, "2024-01-15T00:00:00");
        assert_eq!(set.hrv.len(), 1);
        assert_eq!(set.hrv[0].value, 34.57);
    }

    #[test]
    fn sleep_file_converts_minute_summaries_to_hours() {
        let sleep = r#"[{"dateOfSleep":"2024-01-16","startTime":"2024-01-15T23:10:00.000","endTime":"2024-01-16T07:00:00.000","timeInBed":470,"efficiency":92,"minutesAwake":45,"levels":{"summary":{"light":{"minutes":240},"deep":{"minutes":81},"rem":{"minutes":110},"wake":{"minutes":39}}}},{"startTime":"2024-01-14T23:00:00.000"}]"#;
        let (_dir, path) = build_zip(&[("Sleep/sleep-2024-01-01.json", sleep)]);
        let set = FitbitAdapter.parse(&path).unwrap();

        assert_eq!(set.sleep.len(), 1);
        let row = &set.sleep[0];
        assert_eq!(row.recorded_at, "2024-01-16T00:00:00");
        assert_eq!(row.start.as_deref(), Some("2024-01-15T23:10:00"));
        assert_eq!(row.light_sleep_hours, Some(4.0));
        assert_eq!(row.deep_sleep_hours, Some(1.35));
        assert_eq!(row.awake_hours, Some(0.65));
        assert_eq!(row.sleep_performance_pct, Some(92.0));
    }

    #[test]
    fn exercise_file_maps_activities_and_units() {
        let exercise = r#"[
            {"activityName":"Run","startTime":"01/15/24 07:30:00","activeDuration":1860000,"distance":3.1,"distanceUnit":"Mile","calories":312},
            {"activityName":"Spinning Class","startTime":"2024-01-16T18:00:00.000","duration":2400000,"calories":410}
        ]"#;
        let (_dir, path) = build_zip(&[("Physical Activity/exercise-2024.json", exercise)]);
        let set = FitbitAdapter.parse(&path).unwrap();

        assert_eq!(set.workouts.len(), 2);
        assert_eq!(set.workouts[0].activity, "running");
        assert_eq!(set.workouts[0].recorded_at, "2024-01-15T07:30:00");
        assert_eq!(set.workouts[0].duration_minutes, Some(31.0));
        assert_eq!(set.workouts[0].distance_km, Some(4.989));
        assert_eq!(set.workouts[1].activity, "spinning_class");
        assert_eq!(set.workouts[1].distance_km, None);
    }

    #[test]
    fn malformed_and_unrelated_files_are_skipped() {
        let (_dir, path) = build_zip(&[
            ("Sleep/sleep-2024-01-01.json", "{not json"),
            ("Sleep/sleep_score.csv", "a,b\n1,2\n"),
            ("activities-heart-intraday-2024.json", "[]"),
        ]);
        let set = FitbitAdapter.parse(&path).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn basename_classification() {
        assert_eq!(classify("sleep-2024-01-01.json"), FileKind::Sleep);
        assert_eq!(classify("hrv_2024.json"), FileKind::Hrv);
        assert_eq!(classify("exercise-2024.json"), FileKind::Exercise);
        assert_eq!(classify("activities-heart-2024.json"), FileKind::Heart);
        assert_eq!(classify("activities-heart-intraday-2024.json"), FileKind::Other);
        assert_eq!(classify("steps-2024.json"), FileKind::Other);
    }
}
