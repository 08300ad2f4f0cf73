use log::info;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::audio::analyzer::DEFAULT_THRESHOLD;
use crate::audio::microphone::DEFAULT_SAMPLE_RATE;

const DEFAULT_SCAN_SECS: u64 = 10;
const DEFAULT_CUE_INTERVAL: u32 = 0;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// PostgreSQL URL; workouts are kept in memory when unset
    pub database_url: Option<String>,
    /// Saved heart-rate monitor to connect to without scanning
    pub device_address: Option<String>,
    pub scan_secs: u64,
    pub jump_threshold: i32,
    pub sample_rate: u32,
    /// Cue every N jumps, 0 for never
    pub jump_cue_interval: u32,
    pub export_dir: PathBuf,
}

impl AppConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;

        match &config.device_address {
            Some(address) => info!("Saved heart-rate monitor: {}", address),
            None => info!("No saved heart-rate monitor, will scan for {}s", config.scan_secs),
        }
        if config.database_url.is_none() {
            info!("DATABASE_URL not set, workouts are kept in memory");
        }
        info!(
            "Jump threshold {}, sample rate {} Hz, exports to {}",
            config.jump_threshold,
            config.sample_rate,
            config.export_dir.display()
        );
        if config.jump_cue_interval > 0 {
            info!("Cue every {} jumps", config.jump_cue_interval);
        }

        Ok(config)
    }

    /// Build the config from any key lookup; empty values count as unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Ok(AppConfig {
            database_url: get("DATABASE_URL"),
            device_address: get("HRM_DEVICE_ADDRESS").map(|a| a.to_uppercase()),
            scan_secs: parse_or("HRM_SCAN_SECS", get("HRM_SCAN_SECS"), DEFAULT_SCAN_SECS)?,
            jump_threshold: parse_or("JUMP_THRESHOLD", get("JUMP_THRESHOLD"), DEFAULT_THRESHOLD)?,
            sample_rate: parse_or(
                "AUDIO_SAMPLE_RATE",
                get("AUDIO_SAMPLE_RATE"),
                DEFAULT_SAMPLE_RATE,
            )?,
            jump_cue_interval: parse_or(
                "JUMP_CUE_INTERVAL",
                get("JUMP_CUE_INTERVAL"),
                DEFAULT_CUE_INTERVAL,
            )?,
            export_dir: get("EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}

fn parse_or<T: FromStr>(
    key: &str,
    value: Option<String>,
    default: T,
) -> Result<T, Box<dyn std::error::Error>> {
    match value {
        Some(v) => v
            .parse()
            .map_err(|_| format!("{} has an invalid value: '{}'", key, v).into()),
        None => Ok(default),
    }
}
