//! Table definitions, insert whitelists, and the sleep dedup migration.
//! All statements are idempotent; open runs them every time.

use sqlx::SqlitePool;
use tracing::info;

/// Insertable columns per table. `id` and `created_at` are engine-managed
/// and never accepted from callers.
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

pub const TABLES: &[TableSpec] = &[
    TableSpec {
        name: "heart_rate",
        columns: &["source", "metric", "value", "unit", "recorded_at", "device"],
    },
    TableSpec {
        name: "hrv",
        columns: &["source", "metric", "value", "unit", "recorded_at", "device"],
    },
    TableSpec {
        name: "sleep",
        columns: &[
            "source",
            "stage",
            "start",
            "end",
            "recorded_at",
            "device",
            "sleep_performance_pct",
            "time_in_bed_hours",
            "light_sleep_hours",
            "rem_sleep_hours",
            "deep_sleep_hours",
            "awake_hours",
            "disturbances",
        ],
    },
    TableSpec {
        name: "workouts",
        columns: &[
            "source",
            "activity",
            "duration_minutes",
            "distance_km",
            "calories",
            "recorded_at",
            "end",
            "device",
            "active_calories",
            "avg_cadence",
            "avg_hr",
            "max_hr",
        ],
    },
    TableSpec {
        name: "workout_routes",
        columns: &["workout_start", "timestamp", "latitude", "longitude", "altitude_m"],
    },
    TableSpec {
        name: "whoop_recovery",
        columns: &[
            "source",
            "recorded_at",
            "recovery_score",
            "hrv_ms",
            "resting_heart_rate",
            "spo2_pct",
            "skin_temp_celsius",
        ],
    },
    TableSpec {
        name: "whoop_strain",
        columns: &[
            "source",
            "recorded_at",
            "day_strain",
            "calories",
            "max_heart_rate",
            "avg_heart_rate",
        ],
    },
    TableSpec {
        name: "oura_readiness",
        columns: &[
            "source",
            "recorded_at",
            "readiness_score",
            "hrv_balance",
            "resting_heart_rate",
            "temperature_deviation",
            "recovery_index",
            "activity_balance",
            "sleep_balance",
        ],
    },
];

pub fn table_spec(name: &str) -> Option<&'static TableSpec> {
    TABLES.iter().find(|spec| spec.name == name)
}

pub async fn create_all(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    create_heart_rate_table(pool).await?;
    create_hrv_table(pool).await?;
    create_sleep_table(pool).await?;
    create_workouts_table(pool).await?;
    create_workout_routes_table(pool).await?;
    create_whoop_recovery_table(pool).await?;
    create_whoop_strain_table(pool).await?;
    create_oura_readiness_table(pool).await?;
    create_indexes(pool).await?;
    Ok(())
}

async fn create_heart_rate_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS heart_rate (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT,
            recorded_at TEXT NOT NULL,
            device TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_hrv_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS hrv (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            metric TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT,
            recorded_at TEXT NOT NULL,
            device TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_sleep_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sleep (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            stage TEXT,
            "start" TEXT,
            "end" TEXT,
            recorded_at TEXT NOT NULL,
            device TEXT,
            sleep_performance_pct REAL,
            time_in_bed_hours REAL,
            light_sleep_hours REAL,
            rem_sleep_hours REAL,
            deep_sleep_hours REAL,
            awake_hours REAL,
            disturbances REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_workouts_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // active_calories/avg_cadence/avg_hr/max_hr predate the heart-rate
    // subqueries on the read path and are kept for older databases.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workouts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            activity TEXT NOT NULL,
            duration_minutes REAL,
            distance_km REAL,
            calories REAL,
            recorded_at TEXT NOT NULL,
            "end" TEXT,
            device TEXT,
            active_calories REAL,
            avg_cadence REAL,
            avg_hr REAL,
            max_hr REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_workout_routes_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workout_routes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            workout_start TEXT NOT NULL,
            timestamp TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            altitude_m REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_whoop_recovery_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whoop_recovery (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            recovery_score REAL,
            hrv_ms REAL,
            resting_heart_rate REAL,
            spo2_pct REAL,
            skin_temp_celsius REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_whoop_strain_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS whoop_strain (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            day_strain REAL,
            calories REAL,
            max_heart_rate REAL,
            avg_heart_rate REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_oura_readiness_table(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS oura_readiness (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            readiness_score REAL,
            hrv_balance REAL,
            resting_heart_rate REAL,
            temperature_deviation REAL,
            recovery_index REAL,
            activity_balance REAL,
            sleep_balance REAL,
            created_at TEXT DEFAULT (datetime('now'))
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_indexes(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let statements = [
        "CREATE INDEX IF NOT EXISTS idx_heart_rate_recorded ON heart_rate(recorded_at)",
        "CREATE INDEX IF NOT EXISTS idx_heart_rate_metric ON heart_rate(metric, recorded_at)",
        "CREATE INDEX IF NOT EXISTS idx_hrv_recorded ON hrv(recorded_at)",
        "CREATE INDEX IF NOT EXISTS idx_sleep_recorded ON sleep(recorded_at)",
        r#"CREATE INDEX IF NOT EXISTS idx_sleep_start ON sleep("start")"#,
        "CREATE INDEX IF NOT EXISTS idx_workouts_recorded ON workouts(recorded_at)",
        "CREATE INDEX IF NOT EXISTS idx_routes_workout ON workout_routes(workout_start)",
        // Natural keys: re-ingesting the same export must be a no-op.
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_heart_rate_unique \
         ON heart_rate(source, metric, recorded_at, value, COALESCE(device,''))",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_hrv_unique \
         ON hrv(source, metric, recorded_at, value, COALESCE(device,''))",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_workouts_unique \
         ON workouts(source, activity, recorded_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_routes_unique \
         ON workout_routes(workout_start, COALESCE(timestamp,''), latitude, longitude)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_whoop_recovery_unique \
         ON whoop_recovery(source, recorded_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_whoop_strain_unique \
         ON whoop_strain(source, recorded_at)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_oura_readiness_unique \
         ON oura_readiness(source, recorded_at)",
    ];
    for sql in statements {
        sqlx::query(sql).execute(pool).await?;
    }
    Ok(())
}

/// Sleep rows predating the unique index may exist several times over.
/// Collapse them to the oldest copy, then lock the natural key in with a
/// NULL-safe unique index. Both steps are safe to re-run.
pub async fn migrate_sleep_dedup(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let removed = sqlx::query(
        r#"
        DELETE FROM sleep WHERE id NOT IN (
            SELECT MIN(id) FROM sleep
            GROUP BY source, COALESCE(stage,''), COALESCE("start",''),
                     COALESCE("end",''), COALESCE(device,'')
        )
        "#,
    )
    .execute(pool)
    .await?
    .rows_affected();
    if removed > 0 {
        info!(removed, "collapsed duplicate sleep rows");
    }

    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_sleep_unique ON sleep(
            source, COALESCE(stage,''), COALESCE("start",''),
            COALESCE("end",''), COALESCE(device,'')
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}
