use std::collections::HashMap;

use crate::error::JobError;

/// Stall threshold: more than this many consecutive bad/degraded speed
/// samples declares the job stalled.
const STALL_THRESHOLD: u32 = 5;

/// Accumulates ffmpeg `-progress` `key=value\n` records and tracks the
/// consecutive-stall counter spec.md §4.5 derives from the `speed` field.
///
/// Deliberately tolerant of records straddling a read boundary only in
/// the sense that a malformed line *terminates* parsing rather than
/// panicking — spec.md §9 calls this out as an intentional, conservative
/// simplification rather than a line-reassembly buffer.
#[derive(Default)]
pub struct ProgressTracker {
    status: HashMap<String, String>,
    stall_count: u32,
    last_speed: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses one `read()` worth of bytes (up to 2 KiB in the caller) as a
    /// sequence of `key=value` lines and folds them into `status`.
    pub fn ingest(&mut self, chunk: &str) -> Result<(), JobError> {
        for line in chunk.split('\n') {
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(JobError::ParseProgress { line: line.to_string() });
            };
            self.status.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Re-evaluates the stall counter from the latest `speed` sample.
    /// Returns `true` once the threshold is crossed.
    pub fn update_stall_count(&mut self) -> bool {
        let Some(speed) = self.status.get("speed").cloned() else {
            return self.stall_count > STALL_THRESHOLD;
        };
        let speed = speed.trim();

        if speed == "N/A" {
            self.stall_count += 1;
        } else {
            match parse_speed(speed) {
                Some(fspeed) => {
                    if fspeed < 1.0 && fspeed < self.last_speed {
                        self.stall_count += 1;
                    } else {
                        self.stall_count = 0;
                    }
                    self.last_speed = fspeed;
                }
                None => {
                    self.stall_count += 1;
                }
            }
        }

        self.stall_count > STALL_THRESHOLD
    }
}

/// Parses ffmpeg's `speed` field, formatted like `"0.95x"`.
fn parse_speed(s: &str) -> Option<f64> {
    s.strip_suffix('x')?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_available_counts_as_a_stall_sample() {
        let mut t = ProgressTracker::new();
        t.ingest("speed=N/A\n").unwrap();
        assert!(!t.update_stall_count());
        assert_eq!(t.stall_count, 1);
    }

    #[test]
    fn degrading_sub_realtime_speed_accumulates_stalls() {
        let mut t = ProgressTracker::new();
        t.ingest("speed=0.9x\n").unwrap();
        t.update_stall_count();
        t.ingest("speed=0.5x\n").unwrap();
        assert!(!t.update_stall_count());
        assert_eq!(t.stall_count, 1);
    }

    #[test]
    fn realtime_or_better_resets_the_counter() {
        let mut t = ProgressTracker::new();
        t.ingest("speed=0.2x\n").unwrap();
        t.update_stall_count();
        t.ingest("speed=1.4x\n").unwrap();
        t.update_stall_count();
        assert_eq!(t.stall_count, 0);
    }

    #[test]
    fn six_consecutive_bad_samples_declare_a_stall() {
        let mut t = ProgressTracker::new();
        let mut stalled = false;
        for _ in 0..6 {
            t.ingest("speed=N/A\n").unwrap();
            stalled = t.update_stall_count();
        }
        assert!(stalled);
    }

    #[test]
    fn malformed_line_is_a_parse_error() {
        let mut t = ProgressTracker::new();
        assert!(t.ingest("not-a-kv-pair\n").is_err());
    }
}
