/// A finished (or in-progress) workout as stored by the repository
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutRecord {
    /// Repository-assigned id, 0 until inserted
    pub id: i64,
    pub start_time_millis: i64,
    pub duration_seconds: u64,
    pub avg_heart_rate: Option<u16>,
    pub jump_count: Option<u32>,
    pub jumps_per_minute: Option<f64>,
    pub jump_time_seconds: Option<u64>,
}

/// Periodic snapshot written while a session is active, used only for export
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutSample {
    pub workout_id: i64,
    pub timestamp_millis: i64,
    pub heart_rate: Option<u16>,
    pub jump_count: u32,
}
