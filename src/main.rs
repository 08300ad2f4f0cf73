use log::{error, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{timeout, Duration};

use hrm_jump_tracker::audio::{AudioCaptureLoop, JumpSignalAnalyzer, Microphone, SampleSource};
use hrm_jump_tracker::bluetooth::{
    BluerTransport, ConnectionState, ScannedDevice, SensorConnectionManager, SensorHandle,
};
use hrm_jump_tracker::config::AppConfig;
use hrm_jump_tracker::database::{MemoryRepository, PostgresRepository, WorkoutRepository};
use hrm_jump_tracker::export::{export_csv, export_tcx};
use hrm_jump_tracker::utils::format_elapsed;
use hrm_jump_tracker::workout::{
    teardown, SessionInputs, SessionTiming, WorkoutHandle, WorkoutSessionOrchestrator,
    WorkoutSummary,
};

const PROGRESS_LOG_EVERY_SECS: u64 = 60;

/// Connect to the saved monitor, or scan and take the first one found
async fn connect_sensor(
    sensor: &SensorHandle,
    config: &AppConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(address) = &config.device_address {
        let handle: bluer::Address = address
            .parse()
            .map_err(|e| format!("Invalid HRM_DEVICE_ADDRESS '{}': {}", address, e))?;
        info!("Connecting to saved heart-rate monitor {}", address);
        sensor.connect_to_device(ScannedDevice::new(address.clone(), handle));
        return Ok(());
    }

    info!("Scanning for heart-rate monitors for {}s", config.scan_secs);
    sensor.start_scan();
    let mut scanned = sensor.scanned_devices();
    let found = match timeout(
        Duration::from_secs(config.scan_secs),
        scanned.wait_for(|devices| !devices.is_empty()),
    )
    .await
    {
        Ok(Ok(devices)) => devices.first().cloned(),
        _ => None,
    };
    sensor.stop_scan();

    match found {
        Some(device) => {
            info!("Found {} ({}), connecting", device.name, device.address);
            sensor.connect_to_device(device);
        }
        None => warn!("No heart-rate monitor found, continuing without heart rate"),
    }
    Ok(())
}

/// Log connection changes and link failures for the lifetime of the sensor
fn spawn_sensor_logger(sensor: &SensorHandle) {
    let mut state = sensor.connection_state();
    let mut failures = sensor.subscribe_failures();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *state.borrow_and_update();
                    match current {
                        ConnectionState::Connected => info!("Heart-rate monitor connected"),
                        ConnectionState::Disconnected => warn!("Heart-rate monitor disconnected"),
                        other => info!("Heart-rate monitor {:?}", other),
                    }
                }
                failure = failures.recv() => match failure {
                    Ok(failure) => warn!("Heart-rate monitor: {}", failure),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

/// Run the workout until `stop` is typed
///
/// Reads `pause`, `resume` and `stop` from stdin. If stdin closes the workout
/// keeps running until Ctrl+C.
async fn run_workout(
    workout: &WorkoutHandle,
    sensor: &SensorHandle,
) -> Result<(), Box<dyn std::error::Error>> {
    if !workout.start_workout().await {
        return Err("Workout could not be started".into());
    }
    info!("Type 'pause', 'resume' or 'stop' and press Enter");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut elapsed = workout.elapsed_seconds();
    let heart_rate = sensor.heart_rate();
    let jumps = workout.jump_count();
    let mut cues = workout.subscribe_cues();

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(command) => match command.trim() {
                    "pause" => {
                        if !workout.pause_workout().await {
                            warn!("Workout is not running");
                        }
                    }
                    "resume" => {
                        if !workout.resume_workout().await {
                            warn!("Workout is not paused");
                        }
                    }
                    "stop" => return Ok(()),
                    "" => {}
                    other => warn!("Unknown command '{}'", other),
                },
                None => {
                    info!("stdin closed, press Ctrl+C to stop the workout");
                    stdin_open = false;
                }
            },
            cue = cues.recv() => {
                if let Ok(count) = cue {
                    // Terminal bell as the audible cue.
                    eprint!("\x07");
                    info!("{} jumps", count);
                }
            }
            changed = elapsed.changed() => {
                if changed.is_err() {
                    return Err("Workout task stopped unexpectedly".into());
                }
                let seconds = *elapsed.borrow_and_update();
                if seconds > 0 && seconds % PROGRESS_LOG_EVERY_SECS == 0 {
                    info!(
                        "{} elapsed, HR {:?}, {} jumps",
                        format_elapsed(seconds),
                        *heart_rate.borrow(),
                        *jumps.borrow()
                    );
                }
            }
        }
    }
}

fn log_summary(summary: &WorkoutSummary) {
    info!("Workout summary:");
    info!("  Duration: {}", format_elapsed(summary.duration_seconds));
    match summary.avg_heart_rate {
        Some(bpm) => info!("  Average heart rate: {} bpm", bpm),
        None => info!("  Average heart rate: no data"),
    }
    match summary.jump_count {
        Some(count) => info!("  Jumps: {}", count),
        None => info!("  Jumps: no jump data"),
    }
    if let Some(rate) = summary.jumps_per_minute {
        info!("  Jump rate: {:.1} per minute", rate);
    }
    if let Some(seconds) = summary.jump_time_seconds {
        info!("  Active jumping time: {}s", seconds);
    }
}

async fn export_history(repository: &dyn WorkoutRepository, config: &AppConfig) {
    if let Err(e) = tokio::fs::create_dir_all(&config.export_dir).await {
        error!(
            "Failed to create export directory {}: {}",
            config.export_dir.display(),
            e
        );
        return;
    }
    if let Err(e) = export_csv(repository, &config.export_dir).await {
        error!("CSV export failed: {}", e);
    }
    if let Err(e) = export_tcx(repository, &config.export_dir).await {
        error!("TCX export failed: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match AppConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    let repository: Arc<dyn WorkoutRepository> = match &config.database_url {
        Some(url) => Arc::new(PostgresRepository::new(url.clone())),
        None => Arc::new(MemoryRepository::new()),
    };

    let transport = BluerTransport::new().await?;
    let sensor = SensorConnectionManager::spawn(transport);
    spawn_sensor_logger(&sensor);
    if let Err(e) = connect_sensor(&sensor, &config).await {
        error!("Failed to connect heart-rate monitor: {}", e);
        sensor.shutdown().await;
        return Err(e);
    }

    let source: Arc<dyn SampleSource> = Arc::new(Microphone::new(config.sample_rate));
    let capture = AudioCaptureLoop::new(source, JumpSignalAnalyzer::new(config.jump_threshold));
    let workout = WorkoutSessionOrchestrator::spawn(
        capture,
        SessionInputs::from_sensor(&sensor),
        Arc::clone(&repository),
        SessionTiming::default(),
    );
    workout.set_cue_interval(config.jump_cue_interval);

    // Handle Ctrl+C gracefully
    let (tx, mut rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    // Run the workout or wait for shutdown signal
    tokio::select! {
        result = run_workout(&workout, &sensor) => {
            match result {
                Ok(_) => info!("Workout stopped"),
                Err(e) => error!("Fatal error: {}", e),
            }
        }
        _ = &mut rx => {
            info!("Workout stopped by user. Exiting gracefully.");
        }
    }

    match teardown(workout, sensor).await {
        Some(summary) => log_summary(&summary),
        None => info!("No workout time recorded"),
    }

    export_history(repository.as_ref(), &config).await;

    Ok(())
}
