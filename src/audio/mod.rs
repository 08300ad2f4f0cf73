pub mod analyzer;
pub mod capture;
pub mod microphone;

pub use analyzer::JumpSignalAnalyzer;
pub use capture::{AudioCaptureLoop, AudioError, JumpEvent, SampleSource, SampleStream};
pub use microphone::Microphone;
