/// PostgreSQL-backed workout repository
use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use time::OffsetDateTime;
use tokio_postgres::Row;

use crate::database::connection::execute_with_retry;
use crate::database::repository::{RepositoryError, WorkoutRepository};
use crate::models::{WorkoutRecord, WorkoutSample};
use crate::utils::{datetime_to_millis, millis_to_datetime};

const WORKOUT_COLUMNS: &str = "id, started_at, duration_seconds, avg_heart_rate, jump_count, jumps_per_minute, jump_time_seconds";

/// Stores workouts in the `workouts` and `workout_samples` tables (see `schema.sql`)
///
/// Every operation opens its own connection through the retry helper, so a
/// database restart mid-workout only delays writes.
#[derive(Debug, Clone)]
pub struct PostgresRepository {
    database_url: String,
}

impl PostgresRepository {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
        }
    }
}

/// Column values for a workout row, converted to SQL-friendly types
struct WorkoutColumns {
    started_at: OffsetDateTime,
    duration_seconds: i64,
    avg_heart_rate: Option<i32>,
    jump_count: Option<i32>,
    jumps_per_minute: Option<f64>,
    jump_time_seconds: Option<i64>,
}

impl From<&WorkoutRecord> for WorkoutColumns {
    fn from(w: &WorkoutRecord) -> Self {
        Self {
            started_at: millis_to_datetime(w.start_time_millis),
            duration_seconds: w.duration_seconds as i64,
            avg_heart_rate: w.avg_heart_rate.map(i32::from),
            jump_count: w.jump_count.map(|c| c as i32),
            jumps_per_minute: w.jumps_per_minute,
            jump_time_seconds: w.jump_time_seconds.map(|s| s as i64),
        }
    }
}

fn workout_from_row(row: &Row) -> WorkoutRecord {
    WorkoutRecord {
        id: row.get("id"),
        start_time_millis: datetime_to_millis(row.get("started_at")),
        duration_seconds: row.get::<_, i64>("duration_seconds").max(0) as u64,
        avg_heart_rate: row
            .get::<_, Option<i32>>("avg_heart_rate")
            .map(|v| v as u16),
        jump_count: row.get::<_, Option<i32>>("jump_count").map(|v| v as u32),
        jumps_per_minute: row.get("jumps_per_minute"),
        jump_time_seconds: row
            .get::<_, Option<i64>>("jump_time_seconds")
            .map(|v| v as u64),
    }
}

fn sample_from_row(row: &Row) -> WorkoutSample {
    WorkoutSample {
        workout_id: row.get("workout_id"),
        timestamp_millis: datetime_to_millis(row.get("recorded_at")),
        heart_rate: row.get::<_, Option<i32>>("heart_rate").map(|v| v as u16),
        jump_count: row.get::<_, i32>("jump_count") as u32,
    }
}

impl WorkoutRepository for PostgresRepository {
    fn insert(&self, workout: WorkoutRecord) -> BoxFuture<'_, Result<i64, RepositoryError>> {
        async move {
            execute_with_retry(&self.database_url, move |client| {
                let c = WorkoutColumns::from(&workout);
                async move {
                    let row = client
                        .query_one(
                            "INSERT INTO workouts(started_at, duration_seconds, avg_heart_rate, jump_count, jumps_per_minute, jump_time_seconds)
                             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                            &[
                                &c.started_at,
                                &c.duration_seconds,
                                &c.avg_heart_rate,
                                &c.jump_count,
                                &c.jumps_per_minute,
                                &c.jump_time_seconds,
                            ],
                        )
                        .await?;
                    Ok::<i64, tokio_postgres::Error>(row.get(0))
                }
            })
            .await
            .map_err(RepositoryError::Database)
        }
        .boxed()
    }

    fn update(&self, workout: WorkoutRecord) -> BoxFuture<'_, Result<(), RepositoryError>> {
        async move {
            let id = workout.id;
            let updated = execute_with_retry(&self.database_url, move |client| {
                let c = WorkoutColumns::from(&workout);
                let id = workout.id;
                async move {
                    client
                        .execute(
                            "UPDATE workouts SET started_at = $2, duration_seconds = $3, avg_heart_rate = $4,
                             jump_count = $5, jumps_per_minute = $6, jump_time_seconds = $7
                             WHERE id = $1",
                            &[
                                &id,
                                &c.started_at,
                                &c.duration_seconds,
                                &c.avg_heart_rate,
                                &c.jump_count,
                                &c.jumps_per_minute,
                                &c.jump_time_seconds,
                            ],
                        )
                        .await
                }
            })
            .await
            .map_err(RepositoryError::Database)?;

            if updated == 0 {
                return Err(RepositoryError::NotFound(id));
            }
            Ok(())
        }
        .boxed()
    }

    fn all_descending(&self) -> BoxStream<'_, Result<WorkoutRecord, RepositoryError>> {
        let fetch = async move {
            execute_with_retry(&self.database_url, |client| async move {
                let sql = format!(
                    "SELECT {} FROM workouts ORDER BY started_at DESC",
                    WORKOUT_COLUMNS
                );
                client.query(sql.as_str(), &[]).await
            })
            .await
            .map_err(RepositoryError::Database)
        };

        stream::once(fetch)
            .flat_map(|result| {
                let items: Vec<_> = match result {
                    Ok(rows) => rows.iter().map(|row| Ok(workout_from_row(row))).collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(items)
            })
            .boxed()
    }

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<WorkoutRecord>, RepositoryError>> {
        async move {
            let row = execute_with_retry(&self.database_url, move |client| async move {
                let sql = format!("SELECT {} FROM workouts WHERE id = $1", WORKOUT_COLUMNS);
                client.query_opt(sql.as_str(), &[&id]).await
            })
            .await
            .map_err(RepositoryError::Database)?;

            Ok(row.as_ref().map(workout_from_row))
        }
        .boxed()
    }

    fn insert_sample(&self, sample: WorkoutSample) -> BoxFuture<'_, Result<(), RepositoryError>> {
        async move {
            execute_with_retry(&self.database_url, move |client| {
                let workout_id = sample.workout_id;
                let recorded_at = millis_to_datetime(sample.timestamp_millis);
                let heart_rate = sample.heart_rate.map(i32::from);
                let jump_count = sample.jump_count as i32;
                async move {
                    client
                        .execute(
                            "INSERT INTO workout_samples(workout_id, recorded_at, heart_rate, jump_count)
                             VALUES ($1, $2, $3, $4)",
                            &[&workout_id, &recorded_at, &heart_rate, &jump_count],
                        )
                        .await
                }
            })
            .await
            .map(|_| ())
            .map_err(RepositoryError::Database)
        }
        .boxed()
    }

    fn samples_for_workout(
        &self,
        workout_id: i64,
    ) -> BoxFuture<'_, Result<Vec<WorkoutSample>, RepositoryError>> {
        async move {
            let rows = execute_with_retry(&self.database_url, move |client| async move {
                client
                    .query(
                        "SELECT workout_id, recorded_at, heart_rate, jump_count
                         FROM workout_samples WHERE workout_id = $1 ORDER BY recorded_at ASC",
                        &[&workout_id],
                    )
                    .await
            })
            .await
            .map_err(RepositoryError::Database)?;

            Ok(rows.iter().map(sample_from_row).collect())
        }
        .boxed()
    }
}
