//! # Playback Session
//!
//! Owns one stream's decode path and everything the two playback threads
//! share:
//!
//! ```text
//!            decode thread                          render thread
//!   ┌──────────────────────────────┐        ┌──────────────────────────┐
//!   │ DecodeAdapter → DropController│──────►│ FrameQueue → RenderLoop  │
//!   │ → FrameConverter              │ queue │ → DisplaySurface         │
//!   └──────────────┬───────────────┘        └────────────┬─────────────┘
//!                  └──────── PlaybackClock / SessionState ┘
//! ```
//!
//! A session is finished once the stream ends or fails; it is stopped when
//! the caller asks. Both threads check the stop signal at the top of every
//! iteration.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::clock::{MediaClock, PlaybackClock};
use crate::config::PlaybackConfig;
use crate::convert::{BufferPool, ChannelOrder, ConvertError, ConvertedFrame, FrameConverter, PoolStats, ScalerFactory};
use crate::decode::{DecodeAdapter, DecodeError, DecodeOutcome, Decoder};
use crate::demux::{select_video_stream, Demuxer};
use crate::error::PlaybackError;
use crate::frame_queue::{DropController, DropDecision, Enqueue, FrameQueue};
use crate::render::{DisplayError, DisplaySurface, Rect, RenderLoop};

// ============================================================================
// Shared state
// ============================================================================

/// Why a session finished
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EndReason {
    EndOfStream,
    Stopped,
    DecodeFatal(String),
    IoFatal(String),
    ConvertFatal(String),
    DisplayFatal(String),
}

impl EndReason {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EndOfStream | Self::Stopped)
    }
}

/// Cooperative stop flag that sleeping threads can wait on
#[derive(Default)]
pub struct StopSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Sleep up to `timeout`, waking early on stop. Returns whether the
    /// signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && !timeout.is_zero() {
            self.cond.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

#[derive(Default)]
pub struct Counters {
    units_discarded: AtomicU64,
    frames_decoded: AtomicU64,
    frames_queued: AtomicU64,
    frames_dropped: AtomicU64,
    frames_presented: AtomicU64,
    oom_skips: AtomicU64,
    context_rebuilds: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub units_discarded: u64,
    pub frames_decoded: u64,
    pub frames_queued: u64,
    pub frames_dropped: u64,
    pub frames_presented: u64,
    pub oom_skips: u64,
    pub context_rebuilds: u64,
}

impl Counters {
    pub fn record_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queued(&self) {
        self.frames_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_presented(&self) {
        self.frames_presented.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oom(&self) {
        self.oom_skips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_units_discarded(&self, n: u64) {
        self.units_discarded.store(n, Ordering::Relaxed);
    }

    pub fn set_context_rebuilds(&self, n: u64) {
        self.context_rebuilds.store(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            units_discarded: self.units_discarded.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            frames_queued: self.frames_queued.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            frames_presented: self.frames_presented.load(Ordering::Relaxed),
            oom_skips: self.oom_skips.load(Ordering::Relaxed),
            context_rebuilds: self.context_rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// Termination flags and counters shared by both threads
#[derive(Default)]
pub struct SessionState {
    finished: AtomicBool,
    fatal_error: AtomicBool,
    end_reason: Mutex<Option<EndReason>>,
    stop: StopSignal,
    counters: Counters,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn has_fatal_error(&self) -> bool {
        self.fatal_error.load(Ordering::SeqCst)
    }

    /// Mark the stream ended. The first reason recorded is kept.
    pub fn finish(&self, reason: EndReason) {
        let mut slot = self.end_reason.lock();
        if slot.is_none() {
            if reason.is_fatal() {
                self.fatal_error.store(true, Ordering::SeqCst);
                tracing::error!("Session finished: {:?}", reason);
            } else {
                tracing::info!("Session finished: {:?}", reason);
            }
            *slot = Some(reason);
        }
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason.lock().clone()
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    pub pool: PoolStats,
    pub end_reason: Option<EndReason>,
    pub fatal: bool,
}

impl SessionStats {
    fn collect(state: &SessionState, pool: &BufferPool) -> Self {
        Self {
            counters: state.counters().snapshot(),
            pool: pool.stats(),
            end_reason: state.end_reason(),
            fatal: state.has_fatal_error(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// What one decode step did
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    Queued { pts: f64 },
    /// Late frame discarded
    Dropped { pts: f64 },
    /// Frame lost to an allocation failure
    Skipped,
    /// Queue full, nothing decoded
    Stalled,
    Finished,
}

pub struct PlaybackSession {
    config: PlaybackConfig,
    adapter: DecodeAdapter,
    converter: FrameConverter,
    drops: DropController,
    queue: Arc<FrameQueue>,
    clock: Arc<Mutex<PlaybackClock>>,
    master: Arc<dyn MediaClock>,
    state: Arc<SessionState>,
    pending: Option<ConvertedFrame>,
    last_pts: f64,
}

impl PlaybackSession {
    /// Set up a session for the video stream of `demuxer`.
    ///
    /// `surface_probe` is the display surface's encoding of RGBA (1, 2, 3, 4);
    /// it fixes the converter's channel order for the whole session.
    pub fn open(
        config: PlaybackConfig,
        demuxer: Box<dyn Demuxer>,
        decoder: Box<dyn Decoder>,
        scalers: Box<dyn ScalerFactory>,
        surface_probe: [u8; 4],
        master: Arc<dyn MediaClock>,
    ) -> Result<Self, PlaybackError> {
        config.validate()?;

        let stream = select_video_stream(demuxer.streams())
            .cloned()
            .ok_or(PlaybackError::NoVideoStream)?;

        let order = ChannelOrder::from_probe(surface_probe);
        // Queued frames plus the one on screen plus one waiting for space
        let pool = Arc::new(BufferPool::new(config.max_depth + 2));
        let converter = FrameConverter::new(
            scalers,
            order,
            config.frame_padding,
            config.row_alignment,
            pool,
        );

        tracing::info!(
            "Opened session: stream {} time base {}/{}, depth {}, drops {}",
            stream.index,
            stream.time_base.num,
            stream.time_base.den,
            config.max_depth,
            if config.frame_drops { "on" } else { "off" }
        );

        Ok(Self {
            adapter: DecodeAdapter::new(demuxer, decoder, stream, config.max_decode_retries),
            converter,
            drops: DropController::new(config.frame_drops, config.max_lag_secs),
            queue: Arc::new(FrameQueue::new(config.max_depth)),
            clock: Arc::new(Mutex::new(PlaybackClock::new())),
            master,
            state: Arc::new(SessionState::new()),
            pending: None,
            last_pts: 0.0,
            config,
        })
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn frame_queue(&self) -> &Arc<FrameQueue> {
        &self.queue
    }

    pub fn clock(&self) -> &Arc<Mutex<PlaybackClock>> {
        &self.clock
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats::collect(&self.state, self.converter.pool())
    }

    /// Produce at most one frame into the queue.
    pub fn step(&mut self) -> StepOutcome {
        if self.state.is_finished() {
            return StepOutcome::Finished;
        }

        if let Some(frame) = self.pending.take() {
            return self.offer(frame);
        }
        if self.queue.is_full() {
            return StepOutcome::Stalled;
        }

        let decoded = self.adapter.decode_next_frame(&self.state);
        let counters = self.state.counters();
        counters.set_units_discarded(self.adapter.units_discarded());
        let frame = match decoded {
            DecodeOutcome::Frame(frame) => frame,
            DecodeOutcome::EndOfStream | DecodeOutcome::Fatal(_) => return StepOutcome::Finished,
        };
        counters.record_decoded();

        let pts = match frame.pts {
            Some(ticks) => self.adapter.time_base().ticks_to_secs(ticks),
            None => self.last_pts,
        };
        self.last_pts = pts;

        let now = self.master.now();
        let decision = {
            let clock = self.clock.lock();
            self.drops.evaluate(pts, now, &clock)
        };

        match decision {
            DropDecision::Keep => {}
            DropDecision::Drop { late_by } => {
                tracing::debug!("Dropping frame pts={:.3}, {:.3}s late", pts, late_by);
                counters.record_dropped();
                return StepOutcome::Dropped { pts };
            }
            DropDecision::Abandon { behind_secs } => {
                let err = DecodeError::Lagging { behind_secs };
                tracing::warn!("Abandoning decode at pts={:.3}: {}", pts, err);
                self.state.finish(EndReason::DecodeFatal(err.to_string()));
                return StepOutcome::Finished;
            }
        }

        let converted = self.converter.convert(&frame, pts);
        self.state.counters().set_context_rebuilds(self.converter.rebuilds());
        match converted {
            Ok(converted) => self.offer(converted),
            Err(ConvertError::OutOfMemory(e)) => {
                tracing::warn!("Skipping frame pts={:.3}: {}", pts, e);
                self.state.counters().record_oom();
                StepOutcome::Skipped
            }
            Err(e) => {
                self.state.finish(EndReason::ConvertFatal(e.to_string()));
                StepOutcome::Finished
            }
        }
    }

    fn offer(&mut self, frame: ConvertedFrame) -> StepOutcome {
        let pts = frame.pts;
        match self.queue.try_enqueue(frame) {
            Enqueue::Accepted => {
                self.state.counters().record_queued();
                StepOutcome::Queued { pts }
            }
            Enqueue::Full(frame) => {
                self.pending = Some(frame);
                StepOutcome::Stalled
            }
        }
    }

    fn sync_counters(&self) {
        let counters = self.state.counters();
        counters.set_units_discarded(self.adapter.units_discarded());
        counters.set_context_rebuilds(self.converter.rebuilds());
    }

    /// Decode until the stream ends or the session is stopped
    pub fn run_decode(&mut self) {
        tracing::info!("Decode loop started");
        let tick = self.config.render_tick();
        let stop = Arc::clone(&self.state);

        loop {
            if stop.stop_signal().is_stopped() {
                self.state.finish(EndReason::Stopped);
                break;
            }
            match self.step() {
                StepOutcome::Finished => break,
                StepOutcome::Stalled => {
                    self.queue.wait_for_space(tick);
                }
                StepOutcome::Queued { .. } | StepOutcome::Dropped { .. } | StepOutcome::Skipped => {}
            }
        }

        self.pending = None;
        self.sync_counters();
        tracing::info!("Decode loop finished after {} frames", self.adapter.frames_decoded());
    }

    /// Start the decode and render threads
    pub fn spawn<S>(mut self, surface: S) -> Result<SessionHandle, PlaybackError>
    where
        S: DisplaySurface + 'static,
    {
        let viewport = Rect::new(0, 0, self.config.viewport.width, self.config.viewport.height);
        let mut render = RenderLoop::new(
            surface,
            Arc::clone(&self.queue),
            Arc::clone(&self.clock),
            Arc::clone(&self.master),
            viewport,
            self.config.render_tick(),
        );

        let mut handle = SessionHandle {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            queue: Arc::clone(&self.queue),
            master: Arc::clone(&self.master),
            pool: Arc::clone(self.converter.pool()),
            decode: None,
            render: None,
        };

        let decode = thread::Builder::new()
            .name("cadence-decode".into())
            .spawn(move || self.run_decode())
            .map_err(|source| PlaybackError::Spawn { name: "decode", source })?;

        let state = Arc::clone(&handle.state);
        let queue = Arc::clone(&handle.queue);
        let spawned = thread::Builder::new().name("cadence-render".into()).spawn(move || {
            let result = render.run(&state);
            if let Err(e) = &result {
                state.finish(EndReason::DisplayFatal(e.to_string()));
                state.stop_signal().stop();
                queue.wake_all();
            }
            result
        });

        handle.decode = Some(decode);
        match spawned {
            Ok(render) => {
                handle.render = Some(render);
                Ok(handle)
            }
            Err(source) => {
                handle.stop();
                Err(PlaybackError::Spawn { name: "render", source })
            }
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Controls a running session. Dropping it stops and joins the threads.
pub struct SessionHandle {
    state: Arc<SessionState>,
    clock: Arc<Mutex<PlaybackClock>>,
    queue: Arc<FrameQueue>,
    master: Arc<dyn MediaClock>,
    pool: Arc<BufferPool>,
    decode: Option<JoinHandle<()>>,
    render: Option<JoinHandle<Result<(), DisplayError>>>,
}

impl SessionHandle {
    pub fn pause(&self) {
        self.clock.lock().pause(self.master.now());
        tracing::info!("Playback paused");
    }

    pub fn resume(&self) {
        self.clock.lock().resume(self.master.now());
        tracing::info!("Playback resumed");
    }

    pub fn stop(&self) {
        self.state.stop_signal().stop();
        self.clock.lock().stop();
        self.queue.wake_all();
    }

    /// Stream ended or failed; queued frames may still be showing
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    /// Both threads have exited
    pub fn is_done(&self) -> bool {
        let exited = |h: Option<bool>| h.unwrap_or(true);
        exited(self.decode.as_ref().map(|h| h.is_finished()))
            && exited(self.render.as_ref().map(|h| h.is_finished()))
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats::collect(&self.state, &self.pool)
    }

    /// Wait for both threads and report
    pub fn join(mut self) -> Result<SessionStats, PlaybackError> {
        self.join_threads()?;
        Ok(self.stats())
    }

    fn join_threads(&mut self) -> Result<(), PlaybackError> {
        if let Some(decode) = self.decode.take() {
            decode.join().map_err(|_| PlaybackError::ThreadPanicked("decode"))?;
        }
        if let Some(render) = self.render.take() {
            render.join().map_err(|_| PlaybackError::ThreadPanicked("render"))??;
        }
        Ok(())
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.decode.is_some() || self.render.is_some() {
            self.stop();
            if let Err(e) = self.join_threads() {
                tracing::warn!("Session shut down with error: {}", e);
            }
        }
    }
}
