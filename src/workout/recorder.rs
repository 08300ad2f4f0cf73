/// Ordered persistence of session samples and summaries
///
/// The orchestrator never awaits the repository. It queues messages here and
/// a single task writes them in order, creating the workout row lazily on
/// the first sample so that a zero-length session leaves nothing behind.
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::database::WorkoutRepository;
use crate::models::{WorkoutRecord, WorkoutSample};
use crate::workout::summary::WorkoutSummary;

#[derive(Debug, Clone, PartialEq)]
pub enum RecorderMessage {
    Sample {
        session_start: i64,
        elapsed_seconds: u64,
        timestamp_millis: i64,
        heart_rate: Option<u16>,
        jump_count: u32,
    },
    Finish {
        session_start: i64,
        summary: WorkoutSummary,
    },
}

pub struct SessionRecorder {
    repository: Arc<dyn WorkoutRepository>,
    /// (session start, workout id) of the row created for the running session
    current: Option<(i64, i64)>,
}

impl SessionRecorder {
    pub fn spawn(
        repository: Arc<dyn WorkoutRepository>,
    ) -> (mpsc::UnboundedSender<RecorderMessage>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let recorder = SessionRecorder {
            repository,
            current: None,
        };
        (tx, tokio::spawn(recorder.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RecorderMessage>) {
        while let Some(message) = rx.recv().await {
            match message {
                RecorderMessage::Sample {
                    session_start,
                    elapsed_seconds,
                    timestamp_millis,
                    heart_rate,
                    jump_count,
                } => {
                    let Some(workout_id) = self.workout_id(session_start, elapsed_seconds).await
                    else {
                        continue;
                    };
                    let sample = WorkoutSample {
                        workout_id,
                        timestamp_millis,
                        heart_rate,
                        jump_count,
                    };
                    if let Err(e) = self.repository.insert_sample(sample).await {
                        error!("Failed to store sample for workout {}: {}", workout_id, e);
                    }
                }
                RecorderMessage::Finish {
                    session_start,
                    summary,
                } => self.finish(session_start, summary).await,
            }
        }
        debug!("Session recorder stopped");
    }

    /// Id of the row for `session_start`, inserting a placeholder if needed
    async fn workout_id(&mut self, session_start: i64, elapsed_seconds: u64) -> Option<i64> {
        if let Some((start, id)) = self.current {
            if start == session_start {
                return Some(id);
            }
        }

        let placeholder = WorkoutRecord {
            id: 0,
            start_time_millis: session_start,
            duration_seconds: elapsed_seconds,
            avg_heart_rate: None,
            jump_count: None,
            jumps_per_minute: None,
            jump_time_seconds: None,
        };
        match self.repository.insert(placeholder).await {
            Ok(id) => {
                debug!("Created workout {} for running session", id);
                self.current = Some((session_start, id));
                Some(id)
            }
            Err(e) => {
                error!("Failed to create workout row: {}", e);
                None
            }
        }
    }

    async fn finish(&mut self, session_start: i64, summary: WorkoutSummary) {
        let mut record = summary.to_record(session_start);

        let result = match self.current.take() {
            Some((start, id)) if start == session_start => {
                record.id = id;
                self.repository.update(record).await.map(|_| id)
            }
            _ => self.repository.insert(record).await,
        };

        match result {
            Ok(id) => info!("Successfully stored workout {}", id),
            Err(e) => error!("Failed to store workout: {}", e),
        }
    }
}
