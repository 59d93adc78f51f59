//! Audio/video sync arbitration for the video renderer. All values are
//! microseconds.

use std::time::Duration;

/// Frames within ±2x this of media time are shown immediately.
pub const MAX_VIDEO_SYNC_DIFF: i64 = 10_000;
/// Longest single delay wait; longer delays are re-evaluated in DIFF steps.
pub const MAX_DELAY_THRESHOLD: i64 = 3_000_000;
/// A pts this far from media time is a discontinuity, not a real delay.
pub const PTS_JUMP_THRESHOLD: i64 = 10_000_000;
/// Delay applied to the frame that follows a discontinuity.
pub const PTS_JUMP_DELAY: i64 = 40_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    /// Early by this much: wait, then show.
    Delay(i64),
    Show,
    /// Too late to be shown.
    Drop,
}

/// Classifies a frame by `delay = pts - media_time`. Both ±2·DIFF edges
/// fall into `Show`.
pub fn classify(delay: i64) -> SyncAction {
    let window = 2 * MAX_VIDEO_SYNC_DIFF;
    if delay > window {
        SyncAction::Delay(delay)
    } else if delay >= -window {
        SyncAction::Show
    } else {
        SyncAction::Drop
    }
}

/// How long to wait before showing an early frame.
pub fn delay_wait(delay: i64) -> Duration {
    let wait = if delay < MAX_DELAY_THRESHOLD {
        delay - MAX_VIDEO_SYNC_DIFF
    } else {
        MAX_VIDEO_SYNC_DIFF
    };
    Duration::from_micros(wait.max(0) as u64)
}

/// Delay of a frame against media time, with discontinuity detection.
/// Returns `(delay, jumped)`; on a jump the delay is replaced by
/// [`PTS_JUMP_DELAY`] and the caller re-anchors its clock.
pub fn frame_delay(pts: i64, media_time: i64) -> (i64, bool) {
    let delay = pts.saturating_sub(media_time);
    if delay.saturating_abs() > PTS_JUMP_THRESHOLD {
        (PTS_JUMP_DELAY, true)
    } else {
        (delay, false)
    }
}
