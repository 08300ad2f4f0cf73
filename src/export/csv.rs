use crate::models::WorkoutRecord;
use crate::utils::format_export_date;

pub const CSV_HEADER: &str = "Date,Duration (s),Avg HR,Jumps";

/// One row per workout, in the order given; missing values are empty fields
pub fn build_csv(workouts: &[WorkoutRecord]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for w in workouts {
        let avg_hr = w.avg_heart_rate.map(|v| v.to_string()).unwrap_or_default();
        let jumps = w.jump_count.map(|v| v.to_string()).unwrap_or_default();
        out.push_str(&format!(
            "{},{},{},{}\n",
            format_export_date(w.start_time_millis),
            w.duration_seconds,
            avg_hr,
            jumps
        ));
    }

    out
}
