//! # Frame Queue - Bounded Presentation Buffer
//!
//! Converted frames wait here between the decode thread and the render
//! thread.
//!
//! ```text
//! ┌──────────┐  try_enqueue  ┌────────────┐  dequeue_if_ready  ┌──────────┐
//! │ Decode   │──────────────►│ FrameQueue │───────────────────►│ Render   │
//! │ Thread   │◄──────────────│ (≤ depth)  │                    │ Thread   │
//! └──────────┘  space_cond   └────────────┘                    └──────────┘
//! ```
//!
//! The queue is strict FIFO and never reorders. Lateness is handled before
//! a frame gets here, by the [`DropController`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::clock::{ClockState, PlaybackClock, Schedule};
use crate::convert::ConvertedFrame;

// ============================================================================
// Frame Queue
// ============================================================================

/// Result of [`FrameQueue::try_enqueue`]
#[must_use]
#[derive(Debug)]
pub enum Enqueue {
    Accepted,
    /// Queue at capacity; the frame is handed back
    Full(ConvertedFrame),
}

impl Enqueue {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }
}

/// Thread-safe bounded frame queue
pub struct FrameQueue {
    frames: Mutex<VecDeque<ConvertedFrame>>,
    capacity: usize,

    /// Signalled whenever a frame leaves the queue
    space_cond: Condvar,

    /// Set by [`wake_all`](Self::wake_all); waiters stop waiting for space
    woken: AtomicBool,

    frames_pushed: AtomicU64,
    frames_popped: AtomicU64,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            space_cond: Condvar::new(),
            woken: AtomicBool::new(false),
            frames_pushed: AtomicU64::new(0),
            frames_popped: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Producer API (Decode Thread)
    // ========================================================================

    /// Append at the tail unless the queue is full
    pub fn try_enqueue(&self, frame: ConvertedFrame) -> Enqueue {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return Enqueue::Full(frame);
        }
        frames.push_back(frame);
        self.frames_pushed.fetch_add(1, Ordering::Relaxed);
        Enqueue::Accepted
    }

    /// Block until there is room, the timeout passes, or the queue is woken.
    /// Returns whether there is room.
    pub fn wait_for_space(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();

        while frames.len() >= self.capacity {
            if self.woken.load(Ordering::SeqCst) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.space_cond.wait_for(&mut frames, remaining);
        }
        true
    }

    /// Release every thread blocked in [`wait_for_space`](Self::wait_for_space)
    pub fn wake_all(&self) {
        self.woken.store(true, Ordering::SeqCst);
        let _frames = self.frames.lock();
        self.space_cond.notify_all();
    }

    // ========================================================================
    // Consumer API (Render Thread)
    // ========================================================================

    /// Pop the head frame if the clock says it is due.
    ///
    /// The first frame taken while the clock is unanchored anchors it.
    /// Locks the queue, then the clock.
    pub fn dequeue_if_ready(&self, now: f64, clock: &Mutex<PlaybackClock>) -> Option<ConvertedFrame> {
        let mut frames = self.frames.lock();
        let pts = frames.front()?.pts;

        let due = {
            let mut clock = clock.lock();
            match clock.schedule(pts, now) {
                Schedule::Due { .. } => true,
                Schedule::Unanchored => {
                    clock.anchor(pts, now);
                    true
                }
                Schedule::Early { .. } | Schedule::Held => false,
            }
        };
        if !due {
            return None;
        }

        let frame = frames.pop_front();
        self.frames_popped.fetch_add(1, Ordering::Relaxed);
        self.space_cond.notify_one();
        frame
    }

    // ========================================================================
    // Status
    // ========================================================================

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.frames.lock().len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn frames_pushed(&self) -> u64 {
        self.frames_pushed.load(Ordering::Relaxed)
    }

    pub fn frames_popped(&self) -> u64 {
        self.frames_popped.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Drop Controller
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropDecision {
    Keep,
    /// Late, discard this frame only
    Drop { late_by: f64 },
    /// Hopelessly behind, stop decoding
    Abandon { behind_secs: f64 },
}

/// Staleness policy applied to each frame before it is queued
#[derive(Debug, Clone, Copy)]
pub struct DropController {
    frame_drops: bool,
    max_lag_secs: f64,
}

impl DropController {
    pub fn new(frame_drops: bool, max_lag_secs: f64) -> Self {
        Self {
            frame_drops,
            max_lag_secs,
        }
    }

    pub fn frame_drops(&self) -> bool {
        self.frame_drops
    }

    pub fn evaluate(&self, pts: f64, now: f64, clock: &PlaybackClock) -> DropDecision {
        // Nothing is late while paused or before the first frame has shown
        if clock.state() != ClockState::Running {
            return DropDecision::Keep;
        }
        let Some(scheduled) = clock.presentation_time_for(pts) else {
            return DropDecision::Keep;
        };
        if scheduled >= now {
            return DropDecision::Keep;
        }

        let late_by = now - scheduled;
        if late_by > self.max_lag_secs {
            DropDecision::Abandon { behind_secs: late_by }
        } else if self.frame_drops {
            DropDecision::Drop { late_by }
        } else {
            DropDecision::Keep
        }
    }
}
