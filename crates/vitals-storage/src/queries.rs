//! Read path. Every public query logs failures at `warn!` and returns an
//! empty result instead of propagating; a broken chart is better than a
//! broken caller.

use std::collections::BTreeMap;

use chrono::{Duration, Local, NaiveDate};
use serde::Serialize;
use sqlx::Row;
use tracing::warn;
use vitals_core::reconcile::{reconcile, SleepNight};
use vitals_core::SleepRow;

use crate::{Store, StorageError};

#[derive(Debug, Clone, Serialize)]
pub struct HeartRateDay {
    pub date: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub resting: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HrvDay {
    pub date: String,
    pub value: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemperaturePoint {
    pub date: String,
    pub value: f64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecoveryDay {
    pub date: String,
    pub recovery_score: Option<f64>,
    pub hrv_ms: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub spo2_pct: Option<f64>,
    pub skin_temp_celsius: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrainDay {
    pub date: String,
    pub day_strain: Option<f64>,
    pub calories: Option<f64>,
    pub max_heart_rate: Option<f64>,
    pub avg_heart_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessDay {
    pub date: String,
    pub readiness_score: Option<f64>,
    pub hrv_balance: Option<f64>,
    pub resting_heart_rate: Option<f64>,
    pub temperature_deviation: Option<f64>,
    pub recovery_index: Option<f64>,
    pub activity_balance: Option<f64>,
    pub sleep_balance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkoutSummary {
    pub recorded_at: String,
    pub activity: String,
    pub duration_minutes: Option<f64>,
    pub distance_km: Option<f64>,
    pub calories: Option<f64>,
    pub source: String,
    pub device: Option<String>,
    pub avg_hr: Option<f64>,
    pub max_hr: Option<f64>,
    pub has_route: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutePoint {
    pub timestamp: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartRateSample {
    pub recorded_at: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSegment {
    pub stage: String,
    pub start: String,
    pub end: Option<String>,
    pub device: Option<String>,
}

fn since(days: i64) -> String {
    (Local::now().naive_local().date() - Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}

fn or_empty<T>(result: Result<Vec<T>, StorageError>, query: &'static str) -> Vec<T> {
    match result {
        Ok(rows) => rows,
        Err(err) => {
            warn!(query, %err, "read query failed, returning empty");
            Vec::new()
        }
    }
}

impl Store {
    pub async fn heart_rate_daily(&self, days: i64) -> Vec<HeartRateDay> {
        or_empty(self.heart_rate_daily_inner(days).await, "heart_rate_daily")
    }

    async fn heart_rate_daily_inner(&self, days: i64) -> Result<Vec<HeartRateDay>, StorageError> {
        let cutoff = since(days);
        let rows = sqlx::query(
            r#"
            SELECT h.date, h.avg, h.min, h.max, r.resting
            FROM (
                SELECT SUBSTR(recorded_at, 1, 10) AS date,
                       ROUND(AVG(value), 0) AS avg, MIN(value) AS min, MAX(value) AS max
                FROM heart_rate
                WHERE metric = 'heart_rate' AND recorded_at >= ?
                GROUP BY SUBSTR(recorded_at, 1, 10)
            ) h
            LEFT JOIN (
                SELECT SUBSTR(recorded_at, 1, 10) AS date, ROUND(AVG(value), 0) AS resting
                FROM heart_rate
                WHERE metric = 'resting_heart_rate' AND recorded_at >= ?
                GROUP BY SUBSTR(recorded_at, 1, 10)
            ) r ON r.date = h.date
            ORDER BY h.date
            "#,
        )
        .bind(&cutoff)
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(HeartRateDay {
                date: row.try_get("date")?,
                avg: row.try_get("avg")?,
                min: row.try_get("min")?,
                max: row.try_get("max")?,
                resting: row.try_get("resting")?,
            });
        }
        Ok(out)
    }

    /// Per-date HRV averages; when several sources cover one date the
    /// primary ecosystem source wins.
    pub async fn hrv_daily(&self, days: i64) -> Vec<HrvDay> {
        or_empty(self.hrv_daily_inner(days).await, "hrv_daily")
    }

    async fn hrv_daily_inner(&self, days: i64) -> Result<Vec<HrvDay>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, source, ROUND(AVG(value), 1) AS value
            FROM hrv
            WHERE recorded_at >= ?
            GROUP BY SUBSTR(recorded_at, 1, 10), source
            ORDER BY date
            "#,
        )
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut by_date: BTreeMap<String, HrvDay> = BTreeMap::new();
        for row in rows {
            let day = HrvDay {
                date: row.try_get("date")?,
                value: row.try_get("value")?,
                source: row.try_get("source")?,
            };
            match by_date.get(&day.date) {
                Some(existing) if existing.source == "apple_health" => {}
                Some(_) if day.source != "apple_health" => {}
                _ => {
                    by_date.insert(day.date.clone(), day);
                }
            }
        }
        Ok(by_date.into_values().collect())
    }

    /// Raw sleep rows in range run through the reconciliation cascade.
    pub async fn sleep_nights(&self, days: i64) -> Vec<SleepNight> {
        match self.sleep_rows_inner(days).await {
            Ok(rows) => reconcile(&rows),
            Err(err) => {
                warn!(query = "sleep_nights", %err, "read query failed, returning empty");
                Vec::new()
            }
        }
    }

    async fn sleep_rows_inner(&self, days: i64) -> Result<Vec<SleepRow>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT source, stage, "start", "end", recorded_at, device,
                   sleep_performance_pct, time_in_bed_hours, light_sleep_hours,
                   rem_sleep_hours, deep_sleep_hours, awake_hours, disturbances
            FROM sleep
            WHERE recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SleepRow {
                source: row.try_get("source")?,
                stage: row.try_get("stage")?,
                start: row.try_get("start")?,
                end: row.try_get("end")?,
                recorded_at: row.try_get("recorded_at")?,
                device: row.try_get("device")?,
                sleep_performance_pct: row.try_get("sleep_performance_pct")?,
                time_in_bed_hours: row.try_get("time_in_bed_hours")?,
                light_sleep_hours: row.try_get("light_sleep_hours")?,
                rem_sleep_hours: row.try_get("rem_sleep_hours")?,
                deep_sleep_hours: row.try_get("deep_sleep_hours")?,
                awake_hours: row.try_get("awake_hours")?,
                disturbances: row.try_get("disturbances")?,
            });
        }
        Ok(out)
    }

    /// Hypnogram: raw stage segments starting within 12 hours either side
    /// of the given date's midnight.
    pub async fn sleep_stages(&self, date: &str) -> Vec<StageSegment> {
        or_empty(self.sleep_stages_inner(date).await, "sleep_stages")
    }

    async fn sleep_stages_inner(&self, date: &str) -> Result<Vec<StageSegment>, StorageError> {
        let Ok(day) = NaiveDate::parse_from_str(date, "%Y-%m-%d") else {
            return Ok(Vec::new());
        };
        let midnight = day.and_hms_opt(0, 0, 0).unwrap_or_default();
        let lo = (midnight - Duration::hours(12)).format("%Y-%m-%dT%H:%M:%S").to_string();
        let hi = (midnight + Duration::hours(12)).format("%Y-%m-%dT%H:%M:%S").to_string();

        let rows = sqlx::query(
            r#"
            SELECT stage, "start", "end", device
            FROM sleep
            WHERE "start" IS NOT NULL AND "start" >= ? AND "start" <= ?
              AND stage IN ('deep', 'rem', 'core', 'awake', 'asleep',
                            'asleepdeep', 'asleeprem', 'asleepcore', 'asleepunspecified')
            ORDER BY "start"
            "#,
        )
        .bind(lo)
        .bind(hi)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StageSegment {
                stage: row.try_get("stage")?,
                start: row.try_get("start")?,
                end: row.try_get("end")?,
                device: row.try_get("device")?,
            });
        }
        Ok(out)
    }

    /// Daily SpO2: watch samples merged with strap recovery readings; the
    /// watch wins on dates both cover. Values stored as fractions by older
    /// importers are rescaled here.
    pub async fn blood_oxygen_daily(&self, days: i64) -> Vec<SeriesPoint> {
        or_empty(self.blood_oxygen_daily_inner(days).await, "blood_oxygen_daily")
    }

    async fn blood_oxygen_daily_inner(&self, days: i64) -> Result<Vec<SeriesPoint>, StorageError> {
        let cutoff = since(days);
        let mut by_date: BTreeMap<String, f64> = BTreeMap::new();

        let whoop = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, ROUND(AVG(spo2_pct), 1) AS value
            FROM whoop_recovery
            WHERE spo2_pct IS NOT NULL AND recorded_at >= ?
            GROUP BY SUBSTR(recorded_at, 1, 10)
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        for row in whoop {
            by_date.insert(row.try_get("date")?, row.try_get("value")?);
        }

        let apple = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date,
                   ROUND(AVG(CASE WHEN value <= 1.5 THEN value * 100 ELSE value END), 1) AS value
            FROM heart_rate
            WHERE metric = 'blood_oxygen_spo2' AND recorded_at >= ?
            GROUP BY SUBSTR(recorded_at, 1, 10)
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        for row in apple {
            by_date.insert(row.try_get("date")?, row.try_get("value")?);
        }

        Ok(by_date
            .into_iter()
            .map(|(date, value)| SeriesPoint { date, value })
            .collect())
    }

    pub async fn respiratory_daily(&self, days: i64) -> Vec<SeriesPoint> {
        or_empty(
            self.metric_daily_inner("respiratory_rate", days).await,
            "respiratory_daily",
        )
    }

    /// Fitness estimates change slowly; callers usually pass a year.
    pub async fn vo2max_series(&self, days: i64) -> Vec<SeriesPoint> {
        or_empty(self.metric_daily_inner("vo2_max", days).await, "vo2max_series")
    }

    async fn metric_daily_inner(
        &self,
        metric: &str,
        days: i64,
    ) -> Result<Vec<SeriesPoint>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, ROUND(AVG(value), 1) AS value
            FROM heart_rate
            WHERE metric = ? AND recorded_at >= ?
            GROUP BY SUBSTR(recorded_at, 1, 10)
            ORDER BY date
            "#,
        )
        .bind(metric)
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(SeriesPoint {
                date: row.try_get("date")?,
                value: row.try_get("value")?,
            });
        }
        Ok(out)
    }

    pub async fn recovery_series(&self, days: i64) -> Vec<RecoveryDay> {
        or_empty(self.recovery_series_inner(days).await, "recovery_series")
    }

    async fn recovery_series_inner(&self, days: i64) -> Result<Vec<RecoveryDay>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, recovery_score, hrv_ms,
                   resting_heart_rate, spo2_pct, skin_temp_celsius
            FROM whoop_recovery
            WHERE recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RecoveryDay {
                date: row.try_get("date")?,
                recovery_score: row.try_get("recovery_score")?,
                hrv_ms: row.try_get("hrv_ms")?,
                resting_heart_rate: row.try_get("resting_heart_rate")?,
                spo2_pct: row.try_get("spo2_pct")?,
                skin_temp_celsius: row.try_get("skin_temp_celsius")?,
            });
        }
        Ok(out)
    }

    pub async fn strain_series(&self, days: i64) -> Vec<StrainDay> {
        or_empty(self.strain_series_inner(days).await, "strain_series")
    }

    async fn strain_series_inner(&self, days: i64) -> Result<Vec<StrainDay>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, day_strain, calories,
                   max_heart_rate, avg_heart_rate
            FROM whoop_strain
            WHERE recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(StrainDay {
                date: row.try_get("date")?,
                day_strain: row.try_get("day_strain")?,
                calories: row.try_get("calories")?,
                max_heart_rate: row.try_get("max_heart_rate")?,
                avg_heart_rate: row.try_get("avg_heart_rate")?,
            });
        }
        Ok(out)
    }

    pub async fn readiness_series(&self, days: i64) -> Vec<ReadinessDay> {
        or_empty(self.readiness_series_inner(days).await, "readiness_series")
    }

    async fn readiness_series_inner(&self, days: i64) -> Result<Vec<ReadinessDay>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, readiness_score, hrv_balance,
                   resting_heart_rate, temperature_deviation, recovery_index,
                   activity_balance, sleep_balance
            FROM oura_readiness
            WHERE recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(since(days))
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(ReadinessDay {
                date: row.try_get("date")?,
                readiness_score: row.try_get("readiness_score")?,
                hrv_balance: row.try_get("hrv_balance")?,
                resting_heart_rate: row.try_get("resting_heart_rate")?,
                temperature_deviation: row.try_get("temperature_deviation")?,
                recovery_index: row.try_get("recovery_index")?,
                activity_balance: row.try_get("activity_balance")?,
                sleep_balance: row.try_get("sleep_balance")?,
            });
        }
        Ok(out)
    }

    /// Strap skin temperature and ring temperature deviation, one series
    /// each; the two are on different scales and are never merged.
    pub async fn temperature_series(&self, days: i64) -> Vec<TemperaturePoint> {
        or_empty(self.temperature_series_inner(days).await, "temperature_series")
    }

    async fn temperature_series_inner(
        &self,
        days: i64,
    ) -> Result<Vec<TemperaturePoint>, StorageError> {
        let cutoff = since(days);
        let mut out = Vec::new();

        let whoop = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, skin_temp_celsius AS value
            FROM whoop_recovery
            WHERE skin_temp_celsius IS NOT NULL AND recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        for row in whoop {
            out.push(TemperaturePoint {
                date: row.try_get("date")?,
                value: row.try_get("value")?,
                source: "whoop".to_string(),
            });
        }

        let oura = sqlx::query(
            r#"
            SELECT SUBSTR(recorded_at, 1, 10) AS date, temperature_deviation AS value
            FROM oura_readiness
            WHERE temperature_deviation IS NOT NULL AND recorded_at >= ?
            ORDER BY recorded_at
            "#,
        )
        .bind(&cutoff)
        .fetch_all(self.pool())
        .await?;
        for row in oura {
            out.push(TemperaturePoint {
                date: row.try_get("date")?,
                value: row.try_get("value")?,
                source: "oura".to_string(),
            });
        }

        out.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(out)
    }

    /// Recent workouts with heart-rate stats joined in from the samples
    /// recorded during the workout window (start to end, or start plus two
    /// hours when the end is unknown).
    pub async fn workouts_recent(&self, days: i64, limit: i64) -> Vec<WorkoutSummary> {
        or_empty(self.workouts_recent_inner(days, limit).await, "workouts_recent")
    }

    async fn workouts_recent_inner(
        &self,
        days: i64,
        limit: i64,
    ) -> Result<Vec<WorkoutSummary>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT w.recorded_at, w.activity, w.duration_minutes, w.distance_km,
                   w.calories, w.source, w.device,
                   (SELECT ROUND(AVG(h.value), 0) FROM heart_rate h
                     WHERE h.metric = 'heart_rate'
                       AND h.recorded_at >= w.recorded_at
                       AND h.recorded_at <= COALESCE(w."end",
                           REPLACE(datetime(w.recorded_at, '+2 hours'), ' ', 'T'))) AS avg_hr,
                   (SELECT MAX(h.value) FROM heart_rate h
                     WHERE h.metric = 'heart_rate'
                       AND h.recorded_at >= w.recorded_at
                       AND h.recorded_at <= COALESCE(w."end",
                           REPLACE(datetime(w.recorded_at, '+2 hours'), ' ', 'T'))) AS max_hr,
                   EXISTS(SELECT 1 FROM workout_routes r
                           WHERE SUBSTR(r.workout_start, 1, 16) = SUBSTR(w.recorded_at, 1, 16))
                       AS has_route
            FROM workouts w
            WHERE w.recorded_at >= ?
              AND w.rowid IN (SELECT MIN(rowid) FROM workouts
                              GROUP BY recorded_at, activity, COALESCE(source, ''))
            ORDER BY w.recorded_at DESC
            LIMIT ?
            "#,
        )
        .bind(since(days))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let has_route: i64 = row.try_get("has_route")?;
            out.push(WorkoutSummary {
                recorded_at: row.try_get("recorded_at")?,
                activity: row.try_get("activity")?,
                duration_minutes: row.try_get("duration_minutes")?,
                distance_km: row.try_get("distance_km")?,
                calories: row.try_get("calories")?,
                source: row.try_get("source")?,
                device: row.try_get("device")?,
                avg_hr: row.try_get("avg_hr")?,
                max_hr: row.try_get("max_hr")?,
                has_route: has_route != 0,
            });
        }
        Ok(out)
    }

    /// Route for one workout, matched on the minute (the GPX filename key
    /// and the workout start can differ by seconds).
    pub async fn workout_route(&self, workout_start: &str) -> Vec<RoutePoint> {
        or_empty(self.workout_route_inner(workout_start).await, "workout_route")
    }

    async fn workout_route_inner(
        &self,
        workout_start: &str,
    ) -> Result<Vec<RoutePoint>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, latitude, longitude, altitude_m
            FROM workout_routes
            WHERE SUBSTR(workout_start, 1, 16) = SUBSTR(?, 1, 16)
            ORDER BY timestamp
            LIMIT 5000
            "#,
        )
        .bind(workout_start)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RoutePoint {
                timestamp: row.try_get("timestamp")?,
                latitude: row.try_get("latitude")?,
                longitude: row.try_get("longitude")?,
                altitude_m: row.try_get("altitude_m")?,
            });
        }
        Ok(out)
    }

    /// Heart-rate trace for one workout window.
    pub async fn workout_heart_rate(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Vec<HeartRateSample> {
        or_empty(self.workout_heart_rate_inner(start, end).await, "workout_heart_rate")
    }

    async fn workout_heart_rate_inner(
        &self,
        start: &str,
        end: Option<&str>,
    ) -> Result<Vec<HeartRateSample>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT recorded_at, value
            FROM heart_rate
            WHERE metric = 'heart_rate'
              AND recorded_at >= ?
              AND recorded_at <= COALESCE(?, REPLACE(datetime(?, '+2 hours'), ' ', 'T'))
            ORDER BY recorded_at
            LIMIT 500
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(start)
        .fetch_all(self.pool())
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(HeartRateSample {
                recorded_at: row.try_get("recorded_at")?,
                value: row.try_get("value")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value};

    const ALL: i64 = 36500;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    async fn seeded_store() -> Store {
        Store::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn heart_rate_daily_joins_resting_rate() {
        let store = seeded_store().await;
        store
            .insert_many(
                "heart_rate",
                &[
                    row(json!({"source":"apple_health","metric":"heart_rate","value":60.0,"recorded_at":"2024-01-15T08:00:00"})),
                    row(json!({"source":"apple_health","metric":"heart_rate","value":80.0,"recorded_at":"2024-01-15T09:00:00"})),
                    row(json!({"source":"apple_health","metric":"resting_heart_rate","value":52.0,"recorded_at":"2024-01-15T00:00:00"})),
                ],
            )
            .await
            .unwrap();

        let days = store.heart_rate_daily(ALL).await;
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].date, "2024-01-15");
        assert_eq!(days[0].avg, 70.0);
        assert_eq!(days[0].min, 60.0);
        assert_eq!(days[0].max, 80.0);
        assert_eq!(days[0].resting, Some(52.0));
    }

    #[tokio::test]
    async fn hrv_prefers_watch_source_per_date() {
        let store = seeded_store().await;
        store
            .insert_many(
                "hrv",
                &[
                    row(json!({"source":"whoop","metric":"hrv_sdnn","value":40.0,"recorded_at":"2024-01-15T08:00:00"})),
                    row(json!({"source":"apple_health","metric":"hrv_sdnn","value":55.0,"recorded_at":"2024-01-15T04:00:00"})),
                    row(json!({"source":"whoop","metric":"hrv_sdnn","value":42.0,"recorded_at":"2024-01-16T08:00:00"})),
                ],
            )
            .await
            .unwrap();

        let days = store.hrv_daily(ALL).await;
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].source, "apple_health");
        assert_eq!(days[0].value, 55.0);
        assert_eq!(days[1].source, "whoop");
    }

    #[tokio::test]
    async fn blood_oxygen_rescales_legacy_fractions_and_prefers_watch() {
        let store = seeded_store().await;
        store
            .insert_many(
                "heart_rate",
                &[row(json!({"source":"apple_health","metric":"blood_oxygen_spo2","value":0.97,"recorded_at":"2024-01-15T03:00:00"}))],
            )
            .await
            .unwrap();
        store
            .insert_many(
                "whoop_recovery",
                &[
                    row(json!({"source":"whoop","recorded_at":"2024-01-15T08:00:00","spo2_pct":95.0})),
                    row(json!({"source":"whoop","recorded_at":"2024-01-16T08:00:00","spo2_pct":94.0})),
                ],
            )
            .await
            .unwrap();

        let points = store.blood_oxygen_daily(ALL).await;
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].date, "2024-01-15");
        assert_eq!(points[0].value, 97.0);
        assert_eq!(points[1].value, 94.0);
    }

    #[tokio::test]
    async fn sleep_nights_runs_the_reconciliation_cascade() {
        let store = seeded_store().await;
        // Overlapping deep segments must union to 50 minutes, not 80.
        store
            .insert_many(
                "sleep",
                &[
                    row(json!({"source":"apple_health","stage":"deep","start":"2024-01-15T23:00:00","end":"2024-01-15T23:30:00","recorded_at":"2024-01-15T23:00:00","device":"Apple Watch"})),
                    row(json!({"source":"apple_health","stage":"deep","start":"2024-01-15T23:20:00","end":"2024-01-15T23:50:00","recorded_at":"2024-01-15T23:20:00","device":"Apple Watch"})),
                ],
            )
            .await
            .unwrap();

        let nights = store.sleep_nights(ALL).await;
        assert_eq!(nights.len(), 1);
        assert_eq!(nights[0].deep, 0.83);
    }

    #[tokio::test]
    async fn workouts_join_heart_rate_and_route_presence() {
        let store = seeded_store().await;
        store
            .insert_many(
                "workouts",
                &[row(json!({"source":"apple_health","activity":"running","duration_minutes":31.0,"recorded_at":"2024-01-15T07:30:00","end":"2024-01-15T08:01:00"}))],
            )
            .await
            .unwrap();
        store
            .insert_many(
                "heart_rate",
                &[
                    row(json!({"source":"apple_health","metric":"heart_rate","value":150.0,"recorded_at":"2024-01-15T07:40:00"})),
                    row(json!({"source":"apple_health","metric":"heart_rate","value":160.0,"recorded_at":"2024-01-15T07:50:00"})),
                    row(json!({"source":"apple_health","metric":"heart_rate","value":90.0,"recorded_at":"2024-01-15T12:00:00"})),
                ],
            )
            .await
            .unwrap();
        store
            .insert_many(
                "workout_routes",
                &[row(json!({"workout_start":"2024-01-15T07:30:33","timestamp":"2024-01-15T07:30:40","latitude":40.7,"longitude":-74.0}))],
            )
            .await
            .unwrap();

        let workouts = store.workouts_recent(ALL, 60).await;
        assert_eq!(workouts.len(), 1);
        assert_eq!(workouts[0].avg_hr, Some(155.0));
        assert_eq!(workouts[0].max_hr, Some(160.0));
        assert!(workouts[0].has_route);

        // Route lookup matches on the minute, not the exact second.
        let route = store.workout_route("2024-01-15T07:30:00").await;
        assert_eq!(route.len(), 1);
        assert_eq!(route[0].latitude, 40.7);

        let trace = store
            .workout_heart_rate("2024-01-15T07:30:00", Some("2024-01-15T08:01:00"))
            .await;
        assert_eq!(trace.len(), 2);
    }

    #[tokio::test]
    async fn workout_without_end_uses_two_hour_window() {
        let store = seeded_store().await;
        store
            .insert_many(
                "workouts",
                &[row(json!({"source":"fitbit","activity":"running","recorded_at":"2024-01-15T07:30:00"}))],
            )
            .await
            .unwrap();
        store
            .insert_many(
                "heart_rate",
                &[
                    row(json!({"source":"apple_health","metric":"heart_rate","value":140.0,"recorded_at":"2024-01-15T08:30:00"})),
                    row(json!({"source":"apple_health","metric":"heart_rate","value":95.0,"recorded_at":"2024-01-15T10:30:00"})),
                ],
            )
            .await
            .unwrap();

        let workouts = store.workouts_recent(ALL, 60).await;
        assert_eq!(workouts[0].avg_hr, Some(140.0));
        assert_eq!(workouts[0].max_hr, Some(140.0));
        assert!(!workouts[0].has_route);
    }

    #[tokio::test]
    async fn temperature_series_keeps_sources_separate() {
        let store = seeded_store().await;
        store
            .insert_many(
                "whoop_recovery",
                &[row(json!({"source":"whoop","recorded_at":"2024-01-15T08:00:00","skin_temp_celsius":33.9}))],
            )
            .await
            .unwrap();
        store
            .insert_many(
                "oura_readiness",
                &[row(json!({"source":"oura","recorded_at":"2024-01-15T00:00:00","temperature_deviation":-0.2}))],
            )
            .await
            .unwrap();

        let points = store.temperature_series(ALL).await;
        assert_eq!(points.len(), 2);
        assert!(points.iter().any(|p| p.source == "whoop" && p.value == 33.9));
        assert!(points.iter().any(|p| p.source == "oura" && p.value == -0.2));
    }

    #[tokio::test]
    async fn sleep_stages_window_is_midnight_plus_minus_twelve_hours() {
        let store = seeded_store().await;
        store
            .insert_many(
                "sleep",
                &[
                    row(json!({"source":"apple_health","stage":"deep","start":"2024-01-15T23:00:00","end":"2024-01-15T23:30:00","recorded_at":"2024-01-15T23:00:00","device":"Apple Watch"})),
                    row(json!({"source":"apple_health","stage":"rem","start":"2024-01-16T02:00:00","end":"2024-01-16T02:40:00","recorded_at":"2024-01-16T02:00:00","device":"Apple Watch"})),
                    row(json!({"source":"apple_health","stage":"deep","start":"2024-01-17T23:00:00","end":"2024-01-17T23:30:00","recorded_at":"2024-01-17T23:00:00","device":"Apple Watch"})),
                ],
            )
            .await
            .unwrap();

        let segments = store.sleep_stages("2024-01-16").await;
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].stage, "deep");
        assert_eq!(segments[1].stage, "rem");
        assert!(store.sleep_stages("not-a-date").await.is_empty());
    }
}
