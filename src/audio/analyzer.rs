/// Amplitude-threshold jump detection over microphone sample windows

pub const DEFAULT_THRESHOLD: i32 = 8000;
pub const DEFAULT_COOLDOWN_MS: i64 = 200;
pub const DEFAULT_MAX_GAP_MS: i64 = 2000;

/// Detects footfall impacts as peaks above a threshold
///
/// A jump registers when the window peak exceeds `threshold` and more than
/// `cooldown_ms` has passed since the previous jump. Gaps of at most
/// `max_gap_ms` between consecutive jumps accumulate into the active
/// jumping time; longer gaps count as rest.
#[derive(Debug, Clone)]
pub struct JumpSignalAnalyzer {
    threshold: i32,
    cooldown_ms: i64,
    max_gap_ms: i64,
    last_jump_ms: Option<i64>,
    active_jump_time_ms: i64,
}

impl Default for JumpSignalAnalyzer {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD)
    }
}

impl JumpSignalAnalyzer {
    pub fn new(threshold: i32) -> Self {
        Self::with_timing(threshold, DEFAULT_COOLDOWN_MS, DEFAULT_MAX_GAP_MS)
    }

    pub fn with_timing(threshold: i32, cooldown_ms: i64, max_gap_ms: i64) -> Self {
        Self {
            threshold,
            cooldown_ms,
            max_gap_ms,
            last_jump_ms: None,
            active_jump_time_ms: 0,
        }
    }

    pub fn threshold(&self) -> i32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: i32) {
        self.threshold = threshold;
    }

    pub fn active_jump_time_ms(&self) -> i64 {
        self.active_jump_time_ms
    }

    /// Feed one window of samples captured at `now_ms`
    ///
    /// # Returns
    /// `true` if this window registers a new jump
    pub fn process(&mut self, samples: &[i16], now_ms: i64) -> bool {
        if samples.is_empty() {
            return false;
        }

        let peak = samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0);

        if i32::from(peak) <= self.threshold {
            return false;
        }

        match self.last_jump_ms {
            Some(last) if now_ms - last <= self.cooldown_ms => false,
            Some(last) => {
                let gap = now_ms - last;
                if gap <= self.max_gap_ms {
                    self.active_jump_time_ms += gap;
                }
                self.last_jump_ms = Some(now_ms);
                true
            }
            None => {
                self.last_jump_ms = Some(now_ms);
                true
            }
        }
    }

    /// Forget the previous jump but keep the accumulated active time
    ///
    /// The next jump starts a new streak, so time spent not listening never
    /// counts as active jumping time.
    pub fn end_streak(&mut self) {
        self.last_jump_ms = None;
    }

    /// Forget the previous jump and the accumulated active time
    pub fn reset(&mut self) {
        self.last_jump_ms = None;
        self.active_jump_time_ms = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(amplitude: i16) -> Vec<i16> {
        let mut buf = vec![0i16; 64];
        buf[0] = amplitude;
        buf
    }

    #[test]
    fn peak_above_threshold_is_a_jump() {
        let mut analyzer = JumpSignalAnalyzer::new(5000);
        assert!(analyzer.process(&window(6000), 1000));
    }

    #[test]
    fn peak_below_threshold_is_ignored() {
        let mut analyzer = JumpSignalAnalyzer::new(5000);
        assert!(!analyzer.process(&window(3000), 1000));
    }

    #[test]
    fn threshold_comparison_is_strict() {
        let mut analyzer = JumpSignalAnalyzer::new(5000);
        assert!(!analyzer.process(&window(5000), 1000));
        assert!(analyzer.process(&window(5001), 1000));
    }

    #[test]
    fn negative_samples_count_by_magnitude() {
        let mut analyzer = JumpSignalAnalyzer::new(5000);
        assert!(analyzer.process(&window(-6000), 1000));

        let mut analyzer = JumpSignalAnalyzer::new(32_000);
        assert!(analyzer.process(&window(i16::MIN), 1000));
    }

    #[test]
    fn empty_window_has_no_side_effects() {
        let mut analyzer = JumpSignalAnalyzer::new(5000);
        assert!(!analyzer.process(&[], 1000));
        // still no previous jump, so this one registers without cooldown
        assert!(analyzer.process(&window(6000), 1001));
        assert_eq!(analyzer.active_jump_time_ms(), 0);
    }

    #[test]
    fn cooldown_boundary_is_exclusive() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        assert!(analyzer.process(&window(6000), 1000));
        assert!(!analyzer.process(&window(6000), 1100));
        assert!(!analyzer.process(&window(6000), 1200));
        assert!(analyzer.process(&window(6000), 1201));
    }

    #[test]
    fn threshold_change_applies_to_next_window() {
        let mut analyzer = JumpSignalAnalyzer::new(10_000);
        assert!(!analyzer.process(&window(6000), 1000));
        analyzer.set_threshold(5000);
        assert!(analyzer.process(&window(6000), 1300));
    }

    #[test]
    fn reset_clears_cooldown_and_keeps_threshold() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        assert!(analyzer.process(&window(6000), 1000));
        assert!(!analyzer.process(&window(6000), 1050));

        analyzer.reset();
        assert_eq!(analyzer.threshold(), 5000);
        assert!(analyzer.process(&window(6000), 1050));
    }

    #[test]
    fn ended_streak_keeps_active_time() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        analyzer.process(&window(6000), 1000);
        analyzer.process(&window(6000), 1500);
        analyzer.end_streak();
        assert_eq!(analyzer.active_jump_time_ms(), 500);

        // 1000 ms later would normally count, but the streak was broken.
        assert!(analyzer.process(&window(6000), 2500));
        assert_eq!(analyzer.active_jump_time_ms(), 500);
        assert!(analyzer.process(&window(6000), 3000));
        assert_eq!(analyzer.active_jump_time_ms(), 1000);
    }

    #[test]
    fn close_jumps_accumulate_active_time() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        assert!(analyzer.process(&window(6000), 1000));
        assert_eq!(analyzer.active_jump_time_ms(), 0);
        assert!(analyzer.process(&window(6000), 1500));
        assert_eq!(analyzer.active_jump_time_ms(), 500);
        assert!(analyzer.process(&window(6000), 2000));
        assert_eq!(analyzer.active_jump_time_ms(), 1000);
    }

    #[test]
    fn rest_gaps_are_not_active_time() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        analyzer.process(&window(6000), 1000);
        analyzer.process(&window(6000), 1500);
        assert!(analyzer.process(&window(6000), 6500));
        assert_eq!(analyzer.active_jump_time_ms(), 500);
        assert!(analyzer.process(&window(6000), 7000));
        assert_eq!(analyzer.active_jump_time_ms(), 1000);
    }

    #[test]
    fn gap_equal_to_max_gap_counts() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        analyzer.process(&window(6000), 1000);
        analyzer.process(&window(6000), 3000);
        assert_eq!(analyzer.active_jump_time_ms(), 2000);
    }

    #[test]
    fn reset_clears_active_time() {
        let mut analyzer = JumpSignalAnalyzer::with_timing(5000, 200, 2000);
        analyzer.process(&window(6000), 1000);
        analyzer.process(&window(6000), 1500);
        analyzer.reset();
        assert_eq!(analyzer.active_jump_time_ms(), 0);
    }
}
