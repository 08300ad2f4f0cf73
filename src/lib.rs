//! Heart-rate monitor and jump-detection workout tracker
//!
//! A BLE heart-rate monitor and a microphone-based jump detector feed a
//! single workout session, which persists periodic samples and a summary and
//! can export history as CSV or TCX.
pub mod audio;
pub mod bluetooth;
pub mod config;
pub mod database;
pub mod export;
pub mod models;
pub mod utils;
pub mod workout;
