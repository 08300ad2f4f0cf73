pub mod recorder;
pub mod session;
pub mod summary;

use log::info;

use crate::bluetooth::SensorHandle;

pub use recorder::{RecorderMessage, SessionRecorder};
pub use session::{
    SessionInputs, SessionState, SessionTiming, WorkoutHandle, WorkoutSessionOrchestrator,
};
pub use summary::{compute_summary, WorkoutSummary};

/// Tear down both halves of the app
///
/// The running session is stopped and persisted first, then the sensor link
/// is released. Auto-reconnect is off once this returns.
pub async fn teardown(workout: WorkoutHandle, sensor: SensorHandle) -> Option<WorkoutSummary> {
    let summary = workout.shutdown().await;
    sensor.shutdown().await;
    info!("Shutdown complete");
    summary
}
