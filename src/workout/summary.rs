/// End-of-session summary computation
use crate::models::WorkoutRecord;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutSummary {
    pub duration_seconds: u64,
    pub avg_heart_rate: Option<u16>,
    /// `None` for a session without jumps ("no jump data")
    pub jump_count: Option<u32>,
    /// Jumps per minute of active jumping time, not of session time
    pub jumps_per_minute: Option<f64>,
    pub jump_time_seconds: Option<u64>,
}

impl WorkoutSummary {
    pub fn to_record(&self, start_time_millis: i64) -> WorkoutRecord {
        WorkoutRecord {
            id: 0,
            start_time_millis,
            duration_seconds: self.duration_seconds,
            avg_heart_rate: self.avg_heart_rate,
            jump_count: self.jump_count,
            jumps_per_minute: self.jumps_per_minute,
            jump_time_seconds: self.jump_time_seconds,
        }
    }
}

/// Summarize a session
///
/// # Arguments
/// * `duration_seconds` - Elapsed active (non-paused) time
/// * `heart_rate_readings` - Readings collected while active
/// * `jump_count` - Total jumps detected
/// * `active_jump_time_ms` - Accumulated active jumping time from the analyzer
pub fn compute_summary(
    duration_seconds: u64,
    heart_rate_readings: &[u16],
    jump_count: u32,
    active_jump_time_ms: i64,
) -> WorkoutSummary {
    let avg_heart_rate = if heart_rate_readings.is_empty() {
        None
    } else {
        let sum: u64 = heart_rate_readings.iter().map(|&bpm| bpm as u64).sum();
        Some((sum as f64 / heart_rate_readings.len() as f64).round() as u16)
    };

    let jumps_per_minute = if jump_count > 0 && active_jump_time_ms > 0 {
        Some(jump_count as f64 / (active_jump_time_ms as f64 / 60_000.0))
    } else {
        None
    };

    let jump_time_seconds = if active_jump_time_ms > 0 {
        Some(active_jump_time_ms as u64 / 1000)
    } else {
        None
    };

    WorkoutSummary {
        duration_seconds,
        avg_heart_rate,
        jump_count: (jump_count > 0).then_some(jump_count),
        jumps_per_minute,
        jump_time_seconds,
    }
}
