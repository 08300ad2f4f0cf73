/// Storage interface for workouts and their periodic samples
use futures_util::future::{self, BoxFuture};
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use crate::models::{WorkoutRecord, WorkoutSample};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RepositoryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Workout {0} not found")]
    NotFound(i64),
}

/// Workout persistence as seen by the session orchestrator and exporters
///
/// Implementations are shared as `Arc<dyn WorkoutRepository>`; the caller
/// owns their lifecycle.
pub trait WorkoutRepository: Send + Sync {
    /// Store a new workout, returning its assigned id
    fn insert(&self, workout: WorkoutRecord) -> BoxFuture<'_, Result<i64, RepositoryError>>;

    /// Overwrite the workout with `workout.id`
    fn update(&self, workout: WorkoutRecord) -> BoxFuture<'_, Result<(), RepositoryError>>;

    /// All workouts, most recent start first
    fn all_descending(&self) -> BoxStream<'_, Result<WorkoutRecord, RepositoryError>>;

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<WorkoutRecord>, RepositoryError>>;

    fn insert_sample(&self, sample: WorkoutSample) -> BoxFuture<'_, Result<(), RepositoryError>>;

    /// Samples of one workout in timestamp order
    fn samples_for_workout(
        &self,
        workout_id: i64,
    ) -> BoxFuture<'_, Result<Vec<WorkoutSample>, RepositoryError>>;
}

/// In-process repository, used when no database is configured
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryTables>,
}

#[derive(Debug, Default)]
struct MemoryTables {
    next_id: i64,
    workouts: Vec<WorkoutRecord>,
    samples: Vec<WorkoutSample>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, MemoryTables> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkoutRepository for MemoryRepository {
    fn insert(&self, mut workout: WorkoutRecord) -> BoxFuture<'_, Result<i64, RepositoryError>> {
        let mut tables = self.tables();
        tables.next_id += 1;
        workout.id = tables.next_id;
        tables.workouts.push(workout);
        future::ready(Ok(tables.next_id)).boxed()
    }

    fn update(&self, workout: WorkoutRecord) -> BoxFuture<'_, Result<(), RepositoryError>> {
        let mut tables = self.tables();
        let result = match tables.workouts.iter_mut().find(|w| w.id == workout.id) {
            Some(existing) => {
                *existing = workout;
                Ok(())
            }
            None => Err(RepositoryError::NotFound(workout.id)),
        };
        future::ready(result).boxed()
    }

    fn all_descending(&self) -> BoxStream<'_, Result<WorkoutRecord, RepositoryError>> {
        let mut workouts = self.tables().workouts.clone();
        workouts.sort_by(|a, b| b.start_time_millis.cmp(&a.start_time_millis));
        stream::iter(workouts.into_iter().map(Ok)).boxed()
    }

    fn get_by_id(&self, id: i64) -> BoxFuture<'_, Result<Option<WorkoutRecord>, RepositoryError>> {
        let found = self.tables().workouts.iter().find(|w| w.id == id).cloned();
        future::ready(Ok(found)).boxed()
    }

    fn insert_sample(&self, sample: WorkoutSample) -> BoxFuture<'_, Result<(), RepositoryError>> {
        self.tables().samples.push(sample);
        future::ready(Ok(())).boxed()
    }

    fn samples_for_workout(
        &self,
        workout_id: i64,
    ) -> BoxFuture<'_, Result<Vec<WorkoutSample>, RepositoryError>> {
        let mut samples: Vec<_> = self
            .tables()
            .samples
            .iter()
            .filter(|s| s.workout_id == workout_id)
            .cloned()
            .collect();
        samples.sort_by_key(|s| s.timestamp_millis);
        future::ready(Ok(samples)).boxed()
    }
}
