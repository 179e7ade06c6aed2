//! Apple Health export adapter. Streams `export.xml` straight out of the
//! export zip (the file routinely exceeds available memory when inflated)
//! and pulls workout routes from the bundled GPX files.

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;

use once_cell::sync::Lazy;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use regex::Regex;
use tracing::warn;
use vitals_core::{
    miles_to_km, normalize_pct, rmssd_ms, round_to, MetricSample, RecordSet, RoutePointRow,
    SleepRow, WorkoutRow,
};

use crate::{normalize_timestamp, AdapterError, SourceAdapter};

const TIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S %z", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d"];

const SOURCE: &str = "apple_health";

// Route files are named route_YYYY-MM-DD_HH-MM-SS.gpx; the embedded start
// time is the join key back to the workouts table.
static ROUTE_NAME: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"route_(\d{4}-\d{2}-\d{2})_(\d{2})-(\d{2})-(\d{2})").ok());

pub struct AppleHealthAdapter;

impl SourceAdapter for AppleHealthAdapter {
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
        let export_name = names
            .iter()
            .find(|name| name.ends_with("export.xml") && !name.starts_with("__MACOSX"))
            .cloned()
            .ok_or(AdapterError::MissingPayload("export.xml"))?;

        let mut set = RecordSet::default();
        {
            let entry = archive.by_name(&export_name).map_err(|source| AdapterError::Archive {
                path: path.to_path_buf(),
                source,
            })?;
            parse_export_xml(BufReader::new(entry), &mut set)?;
        }

        for name in &names {
            if name.starts_with("__MACOSX") || !name.to_lowercase().ends_with(".gpx") {
                continue;
            }
            let Some(workout_start) = route_start_from_name(name) else {
                continue;
            };
            match archive.by_name(name) {
                Ok(entry) => {
                    if let Err(err) = parse_gpx(BufReader::new(entry), &workout_start, &mut set) {
                        warn!(route = %name, %err, "skipping unparseable gpx route");
                    }
                }
                Err(err) => {
                    warn!(route = %name, %err, "skipping unreadable gpx entry");
                }
            }
        }
        Ok(set)
    }
}

fn route_start_from_name(name: &str) -> Option<String> {
    let caps = ROUTE_NAME.as_ref()?.captures(name)?;
    Some(format!("{}T{}:{}:{}", &caps[1], &caps[2], &caps[3], &caps[4]))
}

struct RecordAttrs {
    kind: String,
    value: Option<String>,
    recorded_at: String,
    end: Option<String>,
    device: Option<String>,
}

impl RecordAttrs {
    fn from_event(e: &BytesStart) -> Option<Self> {
        let kind = attr_string(e, b"type")?;
        let start = attr_string(e, b"startDate")?;
        Some(Self {
            kind,
            value: attr_string(e, b"value"),
            recorded_at: normalize_timestamp(&start, TIME_FORMATS),
            end: attr_string(e, b"endDate").map(|s| normalize_timestamp(&s, TIME_FORMATS)),
            device: attr_string(e, b"sourceName"),
        })
    }

    fn value_f64(&self) -> Option<f64> {
        self.value.as_deref()?.trim().parse().ok()
    }
}

fn parse_export_xml<R: BufRead>(reader: R, set: &mut RecordSet) -> Result<(), AdapterError> {
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    let mut buf = Vec::new();
    // Beat-to-beat samples nested inside the current HRV record, if any.
    let mut beats: Option<(Vec<f64>, String, Option<String>)> = None;
    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"Record" => {
                    if let Some(record) = RecordAttrs::from_event(&e) {
                        if record.kind == "HKQuantityTypeIdentifierHeartRateVariabilitySDNN" {
                            beats = Some((
                                Vec::new(),
                                record.recorded_at.clone(),
                                record.device.clone(),
                            ));
                        }
                        emit_record(&record, set);
                    }
                }
                b"Workout" => {
                    if let Some(workout) = workout_from_event(&e) {
                        set.workouts.push(workout);
                    }
                }
                _ => {}
            },
            Event::Empty(e) => match e.name().as_ref() {
                b"Record" => {
                    if let Some(record) = RecordAttrs::from_event(&e) {
                        emit_record(&record, set);
                    }
                }
                b"InstantaneousBeatsPerMinute" => {
                    if let (Some((list, _, _)), Some(bpm)) = (beats.as_mut(), attr_f64(&e, b"bpm"))
                    {
                        if bpm > 0.0 {
                            list.push(bpm);
                        }
                    }
                }
                b"Workout" => {
                    if let Some(workout) = workout_from_event(&e) {
                        set.workouts.push(workout);
                    }
                }
                _ => {}
            },
            Event::End(e) if e.name().as_ref() == b"Record" => {
                if let Some((list, recorded_at, device)) = beats.take() {
                    let rr: Vec<f64> = list.iter().map(|bpm| 60.0 / bpm).collect();
                    if let Some(rmssd) = rmssd_ms(&rr) {
                        set.hrv.push(MetricSample {
                            source: SOURCE.into(),
                            metric: "hrv_rmssd".into(),
                            value: rmssd,
                            unit: "ms".into(),
                            recorded_at,
                            device,
                        });
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn emit_record(record: &RecordAttrs, set: &mut RecordSet) {
    match record.kind.as_str() {
        "HKQuantityTypeIdentifierHeartRate" => {
            push_metric(set, record, "heart_rate", "count/min", false);
        }
        "HKQuantityTypeIdentifierRestingHeartRate" => {
            push_metric(set, record, "resting_heart_rate", "count/min", false);
        }
        "HKQuantityTypeIdentifierWalkingHeartRateAverage" => {
            push_metric(set, record, "walking_heart_rate_avg", "count/min", false);
        }
        "HKQuantityTypeIdentifierOxygenSaturation" => {
            push_metric(set, record, "blood_oxygen_spo2", "%", true);
        }
        "HKQuantityTypeIdentifierRespiratoryRate" => {
            push_metric(set, record, "respiratory_rate", "count/min", false);
        }
        "HKQuantityTypeIdentifierVO2Max" => {
            push_metric(set, record, "vo2_max", "mL/kg/min", false);
        }
        "HKQuantityTypeIdentifierHeartRateVariabilitySDNN" => {
            if let Some(value) = record.value_f64() {
                set.hrv.push(MetricSample {
                    source: SOURCE.into(),
                    metric: "hrv_sdnn".into(),
                    value,
                    unit: "ms".into(),
                    recorded_at: record.recorded_at.clone(),
                    device: record.device.clone(),
                });
            }
        }
        "HKCategoryTypeIdentifierSleepAnalysis" => {
            let stage = record.value.as_deref().map(sleep_stage);
            set.sleep.push(SleepRow {
                source: SOURCE.into(),
                stage,
                start: Some(record.recorded_at.clone()),
                end: record.end.clone(),
                recorded_at: record.recorded_at.clone(),
                device: record.device.clone(),
                ..SleepRow::default()
            });
        }
        _ => {}
    }
}

fn push_metric(set: &mut RecordSet, record: &RecordAttrs, metric: &str, unit: &str, pct: bool) {
    let Some(raw) = record.value_f64() else {
        return;
    };
    let value = if pct { normalize_pct(raw) } else { raw };
    set.heart_rate.push(MetricSample {
        source: SOURCE.into(),
        metric: metric.into(),
        value,
        unit: unit.into(),
        recorded_at: record.recorded_at.clone(),
        device: record.device.clone(),
    });
}

fn sleep_stage(raw: &str) -> String {
    match raw {
        "HKCategoryValueSleepAnalysisAsleepDeep" => "deep".into(),
        "HKCategoryValueSleepAnalysisAsleepREM" => "rem".into(),
        "HKCategoryValueSleepAnalysisAsleepCore" => "core".into(),
        "HKCategoryValueSleepAnalysisAsleepUnspecified" => "asleep".into(),
        "HKCategoryValueSleepAnalysisAwake" => "awake".into(),
        "HKCategoryValueSleepAnalysisInBed" => "in_bed".into(),
        other => other.replace("HKCategoryValueSleepAnalysis", "").to_lowercase(),
    }
}

fn workout_from_event(e: &BytesStart) -> Option<WorkoutRow> {
    let raw_type = attr_string(e, b"workoutActivityType")?;
    let start = attr_string(e, b"startDate")?;
    let distance_km = attr_f64(e, b"totalDistance").map(|raw| {
        let unit = attr_string(e, b"totalDistanceUnit").unwrap_or_else(|| "mi".into());
        if unit.starts_with("mi") {
            miles_to_km(raw)
        } else {
            round_to(raw, 3)
        }
    });
    Some(WorkoutRow {
        source: SOURCE.into(),
        activity: activity_name(&raw_type),
        duration_minutes: attr_f64(e, b"duration").map(|d| round_to(d, 2)),
        distance_km,
        calories: attr_f64(e, b"totalEnergyBurned").map(|c| round_to(c, 1)),
        recorded_at: normalize_timestamp(&start, TIME_FORMATS),
        end: attr_string(e, b"endDate").map(|s| normalize_timestamp(&s, TIME_FORMATS)),
        device: attr_string(e, b"sourceName"),
    })
}

fn activity_name(raw: &str) -> String {
    match raw {
        "HKWorkoutActivityTypeRunning" => "running".into(),
        "HKWorkoutActivityTypeWalking" => "walking".into(),
        "HKWorkoutActivityTypeCycling" => "cycling".into(),
        "HKWorkoutActivityTypeSwimming" => "swimming".into(),
        "HKWorkoutActivityTypeHiking" => "hiking".into(),
        "HKWorkoutActivityTypeYoga" => "yoga".into(),
        "HKWorkoutActivityTypeHighIntensityIntervalTraining" => "hiit".into(),
        "HKWorkoutActivityTypeTraditionalStrengthTraining" => "strength_training".into(),
        "HKWorkoutActivityTypeFunctionalStrengthTraining" => "functional_strength".into(),
        other => other.trim_start_matches("HKWorkoutActivityType").to_lowercase(),
    }
}

fn parse_gpx<R: BufRead>(
    reader: R,
    workout_start: &str,
    set: &mut RecordSet,
) -> Result<(), AdapterError> {
    let mut xml = Reader::from_reader(reader);
    xml.config_mut().trim_text(true);

    #[derive(Clone, Copy, PartialEq)]
    enum TextTarget {
        Elevation,
        Time,
    }

    let mut buf = Vec::new();
    let mut current: Option<RoutePointRow> = None;
    let mut target: Option<TextTarget> = None;
    loop {
        match xml.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"trkpt" => current = route_point(&e, workout_start),
                b"ele" if current.is_some() => target = Some(TextTarget::Elevation),
                b"time" if current.is_some() => target = Some(TextTarget::Time),
                _ => {}
            },
            Event::Empty(e) if e.name().as_ref() == b"trkpt" => {
                if let Some(point) = route_point(&e, workout_start) {
                    set.workout_routes.push(point);
                }
            }
            Event::Text(text) => {
                if let (Some(point), Some(which)) = (current.as_mut(), target) {
                    let value = text.unescape().unwrap_or_default().trim().to_string();
                    match which {
                        TextTarget::Elevation => point.altitude_m = value.parse().ok(),
                        TextTarget::Time => {
                            if !value.is_empty() {
                                point.timestamp = value;
                            }
                        }
                    }
                }
            }
            Event::End(e) => match e.name().as_ref() {
                b"trkpt" => {
                    if let Some(point) = current.take() {
                        set.workout_routes.push(point);
                    }
                }
                b"ele" | b"time" => target = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

fn route_point(e: &BytesStart, workout_start: &str) -> Option<RoutePointRow> {
    Some(RoutePointRow {
        workout_start: workout_start.to_string(),
        timestamp: workout_start.to_string(),
        latitude: attr_f64(e, b"lat")?,
        longitude: attr_f64(e, b"lon")?,
        altitude_m: None,
    })
}

fn attr_string(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(|value| value.into_owned()))
}

fn attr_f64(e: &BytesStart, key: &[u8]) -> Option<f64> {
    attr_string(e, key)?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.zip");
        let mut writer = zip::ZipWriter::new(File::create(&path).unwrap());
        for (name, content) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        (dir, path)
    }

    const EXPORT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<HealthData>
 <Record type="HKQuantityTypeIdentifierHeartRate" sourceName="Apple Watch" startDate="2024-01-15 08:00:00 -0500" endDate="2024-01-15 08:00:00 -0500" value="72"/>
 <Record type="HKQuantityTypeIdentifierRestingHeartRate" sourceName="Apple Watch" startDate="2024-01-15 00:00:00 -0500" value="55"/>
 <Record type="HKQuantityTypeIdentifierOxygenSaturation" sourceName="Apple Watch" startDate="2024-01-15 03:11:00 -0500" value="0.97"/>
 <Record type="HKQuantityTypeIdentifierHeartRateVariabilitySDNN" sourceName="Apple Watch" startDate="2024-01-15 04:00:00 -0500" value="48.2">
  <HeartRateVariabilityMetadataList>
   <InstantaneousBeatsPerMinute bpm="60" time="4:00:01"/>
   <InstantaneousBeatsPerMinute bpm="30" time="4:00:03"/>
  </HeartRateVariabilityMetadataList>
 </Record>
 <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Apple Watch" startDate="2024-01-15 23:00:00 -0500" endDate="2024-01-15 23:50:00 -0500" value="HKCategoryValueSleepAnalysisAsleepDeep"/>
 <Record type="HKCategoryTypeIdentifierSleepAnalysis" sourceName="Apple Watch" startDate="2024-01-15 23:50:00 -0500" endDate="2024-01-16 01:20:00 -0500" value="HKCategoryValueSleepAnalysisAsleepCore"/>
 <Workout workoutActivityType="HKWorkoutActivityTypeRunning" sourceName="Apple Watch" startDate="2024-01-15 07:30:00 -0500" endDate="2024-01-15 08:01:00 -0500" duration="31.004" totalDistance="3.1" totalDistanceUnit="mi" totalEnergyBurned="312.44"/>
</HealthData>"#;

    const ROUTE_GPX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<gpx><trk><trkseg>
 <trkpt lat="40.7128" lon="-74.0060"><ele>10.2</ele><time>2024-01-15T12:30:05Z</time></trkpt>
 <trkpt lat="40.7130" lon="-74.0062"/>
</trkseg></trk></gpx>"#;

    #[test]
    fn export_xml_records_map_to_canonical_metrics() {
        let (_dir, path) = build_zip(&[("apple_health_export/export.xml", EXPORT_XML)]);
        let set = AppleHealthAdapter.parse(&path).unwrap();

        let metrics: Vec<(&str, f64)> = set
            .heart_rate
            .iter()
            .map(|m| (m.metric.as_str(), m.value))
            .collect();
        assert!(metrics.contains(&("heart_rate", 72.0)));
        assert!(metrics.contains(&("resting_heart_rate", 55.0)));
        assert!(metrics.contains(&("blood_oxygen_spo2", 97.0)));
        assert_eq!(set.heart_rate[0].recorded_at, "2024-01-15T08:00:00");
        assert_eq!(set.heart_rate[0].device.as_deref(), Some("Apple Watch"));
    }

    #[test]
    fn hrv_record_yields_sdnn_and_derived_rmssd() {
        let (_dir, path) = build_zip(&[("export.xml", EXPORT_XML)]);
        let set = AppleHealthAdapter.parse(&path).unwrap();

        let sdnn = set.hrv.iter().find(|m| m.metric == "hrv_sdnn").unwrap();
        assert_eq!(sdnn.value, 48.2);
        // rr = [1.0s, 2.0s], one diff of 1000 ms.
        let rmssd = set.hrv.iter().find(|m| m.metric == "hrv_rmssd").unwrap();
        assert_eq!(rmssd.value, 1000.0);
        assert_eq!(rmssd.recorded_at, "2024-01-15T04:00:00");
    }

    #[test]
    fn sleep_and_workout_rows_are_normalized() {
        let (_dir, path) = build_zip(&[("export.xml", EXPORT_XML)]);
        let set = AppleHealthAdapter.parse(&path).unwrap();

        assert_eq!(set.sleep.len(), 2);
        assert_eq!(set.sleep[0].stage.as_deref(), Some("deep"));
        assert_eq!(set.sleep[0].start.as_deref(), Some("2024-01-15T23:00:00"));
        assert_eq!(set.sleep[1].stage.as_deref(), Some("core"));

        assert_eq!(set.workouts.len(), 1);
        let workout = &set.workouts[0];
        assert_eq!(workout.activity, "running");
        assert_eq!(workout.duration_minutes, Some(31.0));
        assert_eq!(workout.distance_km, Some(4.989));
        assert_eq!(workout.calories, Some(312.4));
        assert_eq!(workout.end.as_deref(), Some("2024-01-15T08:01:00"));
    }

    #[test]
    fn gpx_routes_attach_to_the_workout_start_key() {
        let (_dir, path) = build_zip(&[
            ("export.xml", EXPORT_XML),
            (
                "apple_health_export/workout-routes/route_2024-01-15_07-30-00.gpx",
                ROUTE_GPX,
            ),
        ]);
        let set = AppleHealthAdapter.parse(&path).unwrap();

        assert_eq!(set.workout_routes.len(), 2);
        let first = &set.workout_routes[0];
        assert_eq!(first.workout_start, "2024-01-15T07:30:00");
        assert_eq!(first.timestamp, "2024-01-15T12:30:05Z");
        assert_eq!(first.latitude, 40.7128);
        assert_eq!(first.altitude_m, Some(10.2));
        // No children on the second point, timestamp falls back to the key.
        assert_eq!(set.workout_routes[1].timestamp, "2024-01-15T07:30:00");
        assert_eq!(set.workout_routes[1].altitude_m, None);
    }

    #[test]
    fn unknown_activity_type_falls_back_to_suffix() {
        assert_eq!(activity_name("HKWorkoutActivityTypeRowing"), "rowing");
        assert_eq!(sleep_stage("HKCategoryValueSleepAnalysisAsleepREM"), "rem");
    }

    #[test]
    fn zip_without_export_xml_is_a_hard_error() {
        let (_dir, path) = build_zip(&[("readme.txt", "nothing here")]);
        let err = AppleHealthAdapter.parse(&path).unwrap_err();
        assert!(matches!(err, AdapterError::MissingPayload("export.xml")));
    }
}
