//! Canonical record model shared by every format adapter.

pub mod reconcile;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "vitals-core";

pub const MILES_TO_KM: f64 = 1.60934;

/// Timestamped scalar sample destined for the `heart_rate` or `hrv` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub source: String,
    pub metric: String,
    pub value: f64,
    pub unit: String,
    pub recorded_at: String,
    pub device: Option<String>,
}

/// Raw sleep row: either an event segment (`start`/`end` populated) or a
/// pre-aggregated nightly total (`stage = "asleep"` with the hour fields set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SleepRow {
    pub source: String,
    pub stage: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub recorded_at: String,
    pub device: Option<String>,
    pub sleep_performance_pct: Option<f64>,
    pub time_in_bed_hours: Option<f64>,
    pub light_sleep_hours: Option<f64>,
    pub rem_sleep_hours: Option<f64>,
    pub deep_sleep_hours: Option<f64>,
    pub awake_hours: Option<f64>,
    pub disturbances: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRow {
    pub source: String,
    pub activity: String,
    pub duration_minutes: Option<f64>,
    pub distance_km: Option<f64>,
    pub calories: Option<f64>,
    pub recorded_at: String,
    pub end: Option<String>,
    pub device: Option<String>,
}

/// One GPS fix from a workout route file, keyed back to its workout by the
/// start timestamp embedded in the route file's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePointRow {
    pub workout_start: String,
    pub timestamp: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryRow {
    pub source: String,
    pub recorded_at: String,
    pub recovery_score: Option<f64>,
    pub hrv_ms: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub spo2_pct: Option<f64>,
    pub skin_temp_celsius: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrainRow {
    pub source: String,
    pub recorded_at: String,
    pub day_strain: Option<f64>,
    pub calories: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub avg_heart_rate: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadinessRow {
    pub source: String,
    pub recorded_at: String,
    pub readiness_score: Option<f64>,
    pub hrv_balance: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub temperature_deviation: Option<f64>,
    pub recovery_index: Option<f64>,
    pub activity_balance: Option<f64>,
    pub sleep_balance: Option<f64>,
}

/// Everything one adapter invocation produced, grouped by destination table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordSet {
    pub heart_rate: Vec<MetricSample>,
    pub hrv: Vec<MetricSample>,
    pub sleep: Vec<SleepRow>,
    pub workouts: Vec<WorkoutRow>,
    pub whoop_recovery: Vec<RecoveryRow>,
    pub whoop_strain: Vec<StrainRow>,
    pub oura_readiness: Vec<ReadinessRow>,
    pub workout_routes: Vec<RoutePointRow>,
}

impl RecordSet {
    pub fn merge(&mut self, other: RecordSet) {
        self.heart_rate.extend(other.heart_rate);
        self.hrv.extend(other.hrv);
        self.sleep.extend(other.sleep);
        self.workouts.extend(other.workouts);
        self.whoop_recovery.extend(other.whoop_recovery);
        self.whoop_strain.extend(other.whoop_strain);
        self.oura_readiness.extend(other.oura_readiness);
        self.workout_routes.extend(other.workout_routes);
    }

    pub fn total(&self) -> usize {
        self.heart_rate.len()
            + self.hrv.len()
            + self.sleep.len()
            + self.workouts.len()
            + self.whoop_recovery.len()
            + self.whoop_strain.len()
            + self.oura_readiness.len()
            + self.workout_routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Flatten into `(table, rows)` pairs in the dynamic shape the storage
    /// layer consumes. Tables with no rows are omitted.
    pub fn into_tables(self) -> Result<Vec<(&'static str, Vec<Map<String, Value>>)>, serde_json::Error> {
        let mut tables = Vec::new();
        push_table(&mut tables, "heart_rate", self.heart_rate)?;
        push_table(&mut tables, "hrv", self.hrv)?;
        push_table(&mut tables, "sleep", self.sleep)?;
        push_table(&mut tables, "workouts", self.workouts)?;
        push_table(&mut tables, "whoop_recovery", self.whoop_recovery)?;
        push_table(&mut tables, "whoop_strain", self.whoop_strain)?;
        push_table(&mut tables, "oura_readiness", self.oura_readiness)?;
        push_table(&mut tables, "workout_routes", self.workout_routes)?;
        Ok(tables)
    }
}

fn push_table<T: Serialize>(
    tables: &mut Vec<(&'static str, Vec<Map<String, Value>>)>,
    name: &'static str,
    rows: Vec<T>,
) -> Result<(), serde_json::Error> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut maps = Vec::with_capacity(rows.len());
    for row in rows {
        if let Value::Object(map) = serde_json::to_value(row)? {
            maps.push(map);
        }
    }
    tables.push((name, maps));
    Ok(())
}

/// Drop a trailing timezone offset by keeping only the local-time portion
/// (`YYYY-MM-DDTHH:MM:SS`, 19 chars). Shorter strings pass through.
pub fn strip_offset(ts: &str) -> &str {
    if ts.len() > 19 {
        &ts[..19]
    } else {
        ts
    }
}

pub fn parse_local(ts: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(strip_offset(ts), "%Y-%m-%dT%H:%M:%S").ok()
}

pub fn date_of(ts: &str) -> Option<NaiveDate> {
    let ts = strip_offset(ts);
    if ts.len() >= 10 {
        NaiveDate::parse_from_str(&ts[..10], "%Y-%m-%d").ok()
    } else {
        None
    }
}

/// Percentages arrive on either a 0-1 or 0-100 scale depending on the vendor
/// and export version. Any value at or below 1.0 is treated as fractional.
pub fn normalize_pct(value: f64) -> f64 {
    if value <= 1.0 {
        round_to(value * 100.0, 1)
    } else {
        value
    }
}

pub fn miles_to_km(miles: f64) -> f64 {
    round_to(miles * MILES_TO_KM, 3)
}

pub fn round_to(value: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (value * factor).round() / factor
}

/// RMSSD in milliseconds from RR intervals given in seconds.
///
/// Root-mean-square of successive differences; needs at least two intervals,
/// otherwise the statistic is undefined and `None` is returned (never zero).
pub fn rmssd_ms(rr_seconds: &[f64]) -> Option<f64> {
    if rr_seconds.len() < 2 {
        return None;
    }
    let mut sum_sq = 0.0;
    for pair in rr_seconds.windows(2) {
        let diff_ms = (pair[1] - pair[0]) * 1000.0;
        sum_sq += diff_ms * diff_ms;
    }
    let mean = sum_sq / (rr_seconds.len() - 1) as f64;
    Some(round_to(mean.sqrt(), 2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_offset_removes_timezone_suffix() {
        assert_eq!(strip_offset("2024-01-15T23:00:00-05:00"), "2024-01-15T23:00:00");
        assert_eq!(strip_offset("2024-01-15T23:00:00"), "2024-01-15T23:00:00");
        assert_eq!(strip_offset("2024-01-15"), "2024-01-15");
    }

    #[test]
    fn date_of_uses_local_portion() {
        let d = date_of("2024-01-16T06:30:00+01:00").unwrap();
        assert_eq!(d.to_string(), "2024-01-16");
        assert!(date_of("garbage").is_none());
    }

    #[test]
    fn normalize_pct_scales_fractions_only() {
        assert_eq!(normalize_pct(0.87), 87.0);
        assert_eq!(normalize_pct(87.0), 87.0);
        assert_eq!(normalize_pct(1.0), 100.0);
    }

    #[test]
    fn rmssd_requires_two_intervals() {
        assert_eq!(rmssd_ms(&[]), None);
        assert_eq!(rmssd_ms(&[0.8]), None);
    }

    #[test]
    fn rmssd_matches_hand_computation() {
        // diffs: +200ms, -100ms -> sqrt((200^2 + 100^2)/2)
        let got = rmssd_ms(&[0.8, 1.0, 0.9]).unwrap();
        let expected = ((200.0f64 * 200.0 + 100.0 * 100.0) / 2.0).sqrt();
        assert!((got - round_to(expected, 2)).abs() < 1e-9);
    }

    #[test]
    fn record_set_flattens_nonempty_tables_only() {
        let mut set = RecordSet::default();
        set.heart_rate.push(MetricSample {
            source: "apple_health".into(),
            metric: "heart_rate".into(),
            value: 72.0,
            unit: "count/min".into(),
            recorded_at: "2024-01-01T08:00:00".into(),
            device: Some("Apple Watch".into()),
        });
        let tables = set.into_tables().unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].0, "heart_rate");
        assert_eq!(tables[0].1[0]["metric"], "heart_rate");
    }
}
