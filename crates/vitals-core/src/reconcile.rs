//! Sleep reconciliation: collapse raw sleep rows into one truthful nightly
//! summary per calendar date.
//!
//! Three-tier cascade: pre-aggregated vendor nights win outright; otherwise
//! raw stage segments are interval-merged per (date, device, stage) and one
//! device is chosen per night; as a last resort, bare in-bed spans are
//! reported as light sleep. Pure function of its input, no storage access.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::debug;

use crate::{date_of, parse_local, round_to, SleepRow};

/// One reconciled night. Hours per stage, rounded to 2 decimals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SleepNight {
    pub date: String,
    pub deep: f64,
    pub rem: f64,
    pub light: f64,
    pub awake: f64,
    pub efficiency: f64,
}

impl SleepNight {
    fn total_sleep(&self) -> f64 {
        self.deep + self.rem + self.light
    }
}

/// Stage classification accepting both the canonical vocabulary and the
/// lowercased vendor tokens that newer exports fall back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageClass {
    Deep,
    Rem,
    Core,
    Unspecified,
    Awake,
    InBed,
}

impl StageClass {
    pub fn classify(stage: &str) -> Option<StageClass> {
        match stage {
            "deep" | "asleepdeep" => Some(StageClass::Deep),
            "rem" | "asleeprem" => Some(StageClass::Rem),
            "core" | "asleepcore" => Some(StageClass::Core),
            "asleep" | "asleepunspecified" => Some(StageClass::Unspecified),
            "awake" => Some(StageClass::Awake),
            "in_bed" | "inbed" => Some(StageClass::InBed),
            _ => None,
        }
    }
}

/// Total hours covered by the union of the given intervals.
///
/// Intervals that overlap or touch are merged before summing, so a device
/// that writes both short per-cycle segments and a long processed block over
/// the same span is counted once.
pub fn union_hours(mut intervals: Vec<(NaiveDateTime, NaiveDateTime)>) -> f64 {
    if intervals.is_empty() {
        return 0.0;
    }
    intervals.sort();
    let mut merged: Vec<(NaiveDateTime, NaiveDateTime)> = vec![intervals[0]];
    for (start, end) in intervals.into_iter().skip(1) {
        match merged.last_mut() {
            Some(last) if start <= last.1 => {
                if end > last.1 {
                    last.1 = end;
                }
            }
            _ => merged.push((start, end)),
        }
    }
    merged
        .iter()
        .map(|(s, e)| (*e - *s).num_seconds() as f64 / 3600.0)
        .sum()
}

/// Run the reconciliation cascade over raw sleep rows.
pub fn reconcile(rows: &[SleepRow]) -> Vec<SleepNight> {
    let nights = preaggregated_nights(rows);
    if !nights.is_empty() {
        return nights;
    }
    let nights = segment_nights(rows);
    if !nights.is_empty() {
        return nights;
    }
    in_bed_nights(rows)
}

/// Tier 1: vendors that deliver one row per night with stage hours already
/// totalled. Used exclusively when present; collisions on a date keep the
/// row with the larger deep+rem+light total (main sleep over nap).
fn preaggregated_nights(rows: &[SleepRow]) -> Vec<SleepNight> {
    let mut by_date: BTreeMap<NaiveDate, SleepNight> = BTreeMap::new();
    for row in rows {
        if row.stage.as_deref() != Some("asleep") {
            continue;
        }
        let has_aggregates = row.deep_sleep_hours.is_some()
            || row.rem_sleep_hours.is_some()
            || row.light_sleep_hours.is_some()
            || row.awake_hours.is_some()
            || row.sleep_performance_pct.is_some();
        if !has_aggregates {
            continue;
        }
        let Some(date) = date_of(&row.recorded_at) else {
            continue;
        };
        let night = SleepNight {
            date: date.to_string(),
            deep: round_to(row.deep_sleep_hours.unwrap_or(0.0), 2),
            rem: round_to(row.rem_sleep_hours.unwrap_or(0.0), 2),
            light: round_to(row.light_sleep_hours.unwrap_or(0.0), 2),
            awake: round_to(row.awake_hours.unwrap_or(0.0), 2),
            efficiency: round_to(row.sleep_performance_pct.unwrap_or(0.0), 0),
        };
        match by_date.get(&date) {
            Some(prev) if prev.total_sleep() >= night.total_sleep() => {}
            _ => {
                by_date.insert(date, night);
            }
        }
    }
    by_date.into_values().collect()
}

#[derive(Debug, Clone, Default)]
struct StageTotals {
    deep: f64,
    rem: f64,
    core: f64,
    unspec: f64,
    awake: f64,
}

/// Tier 2: raw stage segments. Interval union per (date, device, stage),
/// then one device per night: primary-hardware names (containing "watch")
/// beat third-party apps unconditionally, same class is settled by the
/// larger deep+rem total.
fn segment_nights(rows: &[SleepRow]) -> Vec<SleepNight> {
    let mut groups: BTreeMap<(NaiveDate, String, StageClass), Vec<(NaiveDateTime, NaiveDateTime)>> =
        BTreeMap::new();
    for row in rows {
        let Some(class) = row.stage.as_deref().and_then(StageClass::classify) else {
            continue;
        };
        if class == StageClass::InBed {
            continue;
        }
        let Some(interval) = segment_interval(row) else {
            continue;
        };
        let Some(date) = date_of(&row.recorded_at) else {
            continue;
        };
        let device = row.device.clone().unwrap_or_default();
        groups.entry((date, device, class)).or_default().push(interval);
    }

    let mut per_device: BTreeMap<(NaiveDate, String), StageTotals> = BTreeMap::new();
    for ((date, device, class), intervals) in groups {
        let hours = union_hours(intervals);
        let totals = per_device.entry((date, device)).or_default();
        match class {
            StageClass::Deep => totals.deep += hours,
            StageClass::Rem => totals.rem += hours,
            StageClass::Core => totals.core += hours,
            StageClass::Unspecified => totals.unspec += hours,
            StageClass::Awake => totals.awake += hours,
            StageClass::InBed => {}
        }
    }

    let mut best: BTreeMap<NaiveDate, (String, StageTotals)> = BTreeMap::new();
    for ((date, device), totals) in per_device {
        let is_primary = is_primary_hardware(&device);
        let score = totals.deep + totals.rem;
        let wins = match best.get(&date) {
            None => true,
            Some((prev_device, prev_totals)) => {
                let prev_primary = is_primary_hardware(prev_device);
                let prev_score = prev_totals.deep + prev_totals.rem;
                (is_primary && !prev_primary)
                    || (is_primary == prev_primary && score > prev_score)
            }
        };
        if wins {
            best.insert(date, (device, totals));
        }
    }

    let mut nights = Vec::new();
    for (date, (device, totals)) in best {
        // A device with any detailed stage data also writes a long
        // unspecified umbrella over the whole session; counting it as light
        // would double the night. Use core as light, or the umbrella only
        // when no detailed stages exist at all.
        let has_stage_tracking = totals.deep > 0.0 || totals.rem > 0.0 || totals.core > 0.0;
        let light = if has_stage_tracking { totals.core } else { totals.unspec };
        if totals.deep + totals.rem + light <= 0.0 {
            debug!(date = %date, device = %device, "dropping night with no usable stage hours");
            continue;
        }
        nights.push(SleepNight {
            date: date.to_string(),
            deep: round_to(totals.deep, 2),
            rem: round_to(totals.rem, 2),
            light: round_to(light, 2),
            awake: round_to(totals.awake, 2),
            efficiency: 0.0,
        });
    }
    nights
}

/// Tier 3: bare in-bed spans, union-merged per date, reported as light sleep.
fn in_bed_nights(rows: &[SleepRow]) -> Vec<SleepNight> {
    let mut by_date: BTreeMap<NaiveDate, Vec<(NaiveDateTime, NaiveDateTime)>> = BTreeMap::new();
    for row in rows {
        if row.stage.as_deref().and_then(StageClass::classify) != Some(StageClass::InBed) {
            continue;
        }
        let Some(interval) = segment_interval(row) else {
            continue;
        };
        let Some(date) = date_of(&row.recorded_at) else {
            continue;
        };
        by_date.entry(date).or_default().push(interval);
    }
    by_date
        .into_iter()
        .filter_map(|(date, intervals)| {
            let light = round_to(union_hours(intervals), 2);
            (light > 0.0).then(|| SleepNight {
                date: date.to_string(),
                deep: 0.0,
                rem: 0.0,
                light,
                awake: 0.0,
                efficiency: 0.0,
            })
        })
        .collect()
}

/// Half-open segment span, discarding zero and negative durations.
fn segment_interval(row: &SleepRow) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = parse_local(row.start.as_deref()?)?;
    let end = parse_local(row.end.as_deref()?)?;
    (end > start).then_some((start, end))
}

fn is_primary_hardware(device: &str) -> bool {
    device.to_lowercase().contains("watch")
}
