use std::time::{Duration, Instant};

/// Wall-clock baseline for self-timed playback (no external clock).
///
/// media_time = now - wall_time_base - pause_duration + first_show_pts
#[derive(Debug, Clone)]
pub struct MediaClock {
    wall_time_base: Instant,
    pause_duration: Duration,
    pause_time_point: Option<Instant>,
    first_show_pts: i64,
    pre_frame_pts: i64,
}

impl MediaClock {
    pub fn new() -> Self {
        Self {
            wall_time_base: Instant::now(),
            pause_duration: Duration::ZERO,
            pause_time_point: None,
            first_show_pts: 0,
            pre_frame_pts: 0,
        }
    }

    /// Re-anchors the curve on `pts` at `now`.
    pub fn reset(&mut self, pts: i64, now: Instant) {
        self.wall_time_base = now;
        self.pause_duration = Duration::ZERO;
        self.pause_time_point = None;
        self.first_show_pts = pts;
        self.pre_frame_pts = pts;
    }

    /// Current media time in microseconds.
    pub fn media_time(&self, now: Instant) -> i64 {
        // While paused the curve is frozen at the pause point.
        let now = self.pause_time_point.unwrap_or(now);
        let elapsed = now
            .saturating_duration_since(self.wall_time_base)
            .saturating_sub(self.pause_duration);
        elapsed.as_micros() as i64 + self.first_show_pts
    }

    pub fn pause(&mut self, now: Instant) {
        if self.pause_time_point.is_none() {
            self.pause_time_point = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.pause_time_point.take() {
            self.pause_duration += now.saturating_duration_since(paused_at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.pause_time_point.is_some()
    }

    pub fn first_show_pts(&self) -> i64 {
        self.first_show_pts
    }

    pub fn pause_duration(&self) -> Duration {
        self.pause_duration
    }

    pub fn pre_frame_pts(&self) -> i64 {
        self.pre_frame_pts
    }

    pub fn set_pre_frame_pts(&mut self, pts: i64) {
        self.pre_frame_pts = pts;
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        Self::new()
    }
}
