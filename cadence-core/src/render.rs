//! Presentation: display surface boundary and the render loop.
//!
//! The render loop polls the frame queue on a fixed tick. A due frame is
//! uploaded to the surface under the current-frame lock; when nothing is due
//! the surface is presented again unchanged.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{MediaClock, PlaybackClock};
use crate::convert::{ChannelOrder, ConvertedFrame, BYTES_PER_PIXEL};
use crate::frame_queue::FrameQueue;
use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum DisplayError {
    #[error("Surface upload failed: {0}")]
    Upload(String),
    #[error("Present failed: {0}")]
    Present(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Texture/surface the render loop draws into
pub trait DisplaySurface: Send {
    /// Memory bytes of the surface's native encoding of RGBA (1, 2, 3, 4)
    fn channel_probe(&self) -> [u8; 4];

    /// Copy `src` (a region of `frame`) into the `dst` rectangle
    fn upload(&mut self, frame: &ConvertedFrame, src: Rect, dst: Rect) -> Result<(), DisplayError>;

    /// Make the last upload visible
    fn present(&mut self) -> Result<(), DisplayError>;
}

// ============================================================================
// Memory surface
// ============================================================================

/// Headless surface holding the last uploaded picture in memory
pub struct MemorySurface {
    order: ChannelOrder,
    pixels: Vec<u8>,
    size: (u32, u32),
    dest: Rect,
    uploads: u64,
    presents: u64,
}

impl MemorySurface {
    pub fn new(order: ChannelOrder) -> Self {
        Self {
            order,
            pixels: Vec::new(),
            size: (0, 0),
            dest: Rect::default(),
            uploads: 0,
            presents: 0,
        }
    }

    /// Tightly packed pixels of the last upload
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn dest(&self) -> Rect {
        self.dest
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn presents(&self) -> u64 {
        self.presents
    }
}

impl DisplaySurface for MemorySurface {
    fn channel_probe(&self) -> [u8; 4] {
        self.order.probe_bytes()
    }

    fn upload(&mut self, frame: &ConvertedFrame, src: Rect, dst: Rect) -> Result<(), DisplayError> {
        if src.x + src.width > frame.width || src.y + src.height > frame.height {
            return Err(DisplayError::Upload(format!(
                "source {:?} outside {}x{} frame",
                src, frame.width, frame.height
            )));
        }

        let row_bytes = src.width as usize * BYTES_PER_PIXEL;
        self.pixels.clear();
        self.pixels.reserve(row_bytes * src.height as usize);
        for row in src.y..src.y + src.height {
            let start = row as usize * frame.stride + src.x as usize * BYTES_PER_PIXEL;
            self.pixels.extend_from_slice(&frame.pixels()[start..start + row_bytes]);
        }

        self.size = (src.width, src.height);
        self.dest = dst;
        self.uploads += 1;
        Ok(())
    }

    fn present(&mut self) -> Result<(), DisplayError> {
        self.presents += 1;
        Ok(())
    }
}

// ============================================================================
// Current frame slot
// ============================================================================

/// The frame on screen. Held until the next one replaces it, then its buffer
/// goes back to the pool.
#[derive(Default)]
pub struct CurrentFrame {
    slot: Mutex<Option<ConvertedFrame>>,
}

impl CurrentFrame {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pts(&self) -> Option<f64> {
        self.slot.lock().as_ref().map(|f| f.pts)
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }
}

// ============================================================================
// Render Loop
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TickOutcome {
    /// A new frame was uploaded and presented
    Presented { pts: f64 },
    /// Nothing due; previous content presented again
    Repeated,
}

pub struct RenderLoop<S> {
    surface: S,
    queue: Arc<FrameQueue>,
    clock: Arc<Mutex<PlaybackClock>>,
    master: Arc<dyn MediaClock>,
    current: Arc<CurrentFrame>,
    viewport: Rect,
    tick: Duration,
    presented: u64,
    repeated: u64,
}

impl<S: DisplaySurface> RenderLoop<S> {
    pub fn new(
        surface: S,
        queue: Arc<FrameQueue>,
        clock: Arc<Mutex<PlaybackClock>>,
        master: Arc<dyn MediaClock>,
        viewport: Rect,
        tick: Duration,
    ) -> Self {
        Self {
            surface,
            queue,
            clock,
            master,
            current: Arc::new(CurrentFrame::new()),
            viewport,
            tick,
            presented: 0,
            repeated: 0,
        }
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn current(&self) -> &Arc<CurrentFrame> {
        &self.current
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn repeated(&self) -> u64 {
        self.repeated
    }

    /// One presentation check. Never waits for a frame.
    pub fn tick(&mut self) -> Result<TickOutcome, DisplayError> {
        let now = self.master.now();
        let outcome = match self.queue.dequeue_if_ready(now, &self.clock) {
            Some(frame) => {
                let pts = frame.pts;
                let src = frame.content_rect();
                let mut slot = self.current.slot.lock();
                self.surface.upload(&frame, src, self.viewport)?;
                *slot = Some(frame);
                drop(slot);

                self.presented += 1;
                TickOutcome::Presented { pts }
            }
            None => {
                self.repeated += 1;
                TickOutcome::Repeated
            }
        };

        self.surface.present()?;
        Ok(outcome)
    }

    /// Tick until stopped or until the stream has ended and every queued
    /// frame has been shown.
    pub fn run(&mut self, session: &SessionState) -> Result<(), DisplayError> {
        tracing::info!("Render loop started, tick {:?}", self.tick);
        let stop = session.stop_signal();

        loop {
            if stop.is_stopped() {
                tracing::debug!("Render loop stopping on request");
                break;
            }

            let started = Instant::now();
            if let TickOutcome::Presented { pts } = self.tick()? {
                session.counters().record_presented();
                tracing::trace!("Presented frame pts={:.3}", pts);
            }

            if session.is_finished() && self.queue.is_empty() {
                tracing::debug!("Stream ended and queue drained");
                break;
            }

            let remaining = self.tick.saturating_sub(started.elapsed());
            if stop.wait_timeout(remaining) {
                break;
            }
        }

        tracing::info!(
            "Render loop finished: {} presented, {} repeated",
            self.presented,
            self.repeated
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::convert::{BufferPool, FrameConverter};
    use crate::decode::{DecodedFrame, PixelFormat, Plane};
    use crate::scaler::SoftwareScalerFactory;
    use bytes::Bytes;

    fn converted(conv: &mut FrameConverter, pts: f64, shade: u8) -> ConvertedFrame {
        let frame = DecodedFrame {
            planes: vec![Plane {
                data: Bytes::from(vec![shade; 2 * 2 * 4]),
                stride: 8,
            }],
            format: PixelFormat::Rgba,
            width: 2,
            height: 2,
            pts: None,
            keyframe: true,
        };
        conv.convert(&frame, pts).unwrap()
    }

    fn setup() -> (RenderLoop<MemorySurface>, Arc<FrameQueue>, Arc<ManualClock>, FrameConverter) {
        let queue = Arc::new(FrameQueue::new(5));
        let clock = Arc::new(Mutex::new(PlaybackClock::new()));
        clock.lock().start_at(0.0);
        let master = Arc::new(ManualClock::new(0.0));
        let render = RenderLoop::new(
            MemorySurface::new(ChannelOrder::Rgba),
            Arc::clone(&queue),
            clock,
            master.clone(),
            Rect::new(0, 0, 640, 360),
            Duration::from_millis(20),
        );
        let conv = FrameConverter::new(
            Box::new(SoftwareScalerFactory::default()),
            ChannelOrder::Rgba,
            4,
            16,
            Arc::new(BufferPool::new(8)),
        );
        (render, queue, master, conv)
    }

    #[test]
    fn empty_queue_repeats_previous_content() {
        let (mut render, queue, _master, mut conv) = setup();
        assert!(queue.try_enqueue(converted(&mut conv, 0.0, 77)).is_accepted());

        assert_eq!(render.tick().unwrap(), TickOutcome::Presented { pts: 0.0 });
        let shown = render.surface().pixels().to_vec();

        let started = Instant::now();
        assert_eq!(render.tick().unwrap(), TickOutcome::Repeated);
        assert!(started.elapsed() < Duration::from_millis(20));

        assert_eq!(render.surface().pixels(), shown.as_slice());
        assert_eq!(render.surface().uploads(), 1);
        assert_eq!(render.surface().presents(), 2);
        assert_eq!(render.current().pts(), Some(0.0));
    }

    #[test]
    fn early_frame_waits_for_its_time() {
        let (mut render, queue, master, mut conv) = setup();
        assert!(queue.try_enqueue(converted(&mut conv, 1.0, 10)).is_accepted());

        master.set(0.5);
        assert_eq!(render.tick().unwrap(), TickOutcome::Repeated);
        assert_eq!(queue.len(), 1);

        master.set(1.0);
        assert_eq!(render.tick().unwrap(), TickOutcome::Presented { pts: 1.0 });
        assert!(queue.is_empty());
    }

    #[test]
    fn upload_crops_padding() {
        let (mut render, queue, _master, mut conv) = setup();
        assert!(queue.try_enqueue(converted(&mut conv, 0.0, 200)).is_accepted());
        render.tick().unwrap();

        let surface = render.surface();
        assert_eq!(surface.size(), (2, 2));
        assert_eq!(surface.pixels().len(), 2 * 2 * 4);
        assert!(surface.pixels().iter().all(|&b| b == 200));
        assert_eq!(surface.dest(), Rect::new(0, 0, 640, 360));
    }

    #[test]
    fn replaced_frame_returns_to_pool() {
        let (mut render, queue, _master, mut conv) = setup();
        let pool = Arc::clone(conv.pool());
        assert!(queue.try_enqueue(converted(&mut conv, 0.0, 1)).is_accepted());
        assert!(queue.try_enqueue(converted(&mut conv, 0.0, 2)).is_accepted());

        render.tick().unwrap();
        assert_eq!(pool.stats().available, 0);
        render.tick().unwrap();
        assert_eq!(pool.stats().available, 1);

        render.current().clear();
        assert_eq!(pool.stats().available, 2);
    }

    #[test]
    fn run_exits_when_finished_and_drained() {
        let (mut render, queue, master, mut conv) = setup();
        for i in 0..3 {
            assert!(queue.try_enqueue(converted(&mut conv, i as f64 * 0.01, i)).is_accepted());
        }
        master.set(1.0);

        let session = SessionState::new();
        session.finish(crate::session::EndReason::EndOfStream);
        render.run(&session).unwrap();

        assert_eq!(render.presented(), 3);
        assert!(queue.is_empty());
        assert_eq!(session.counters().snapshot().frames_presented, 3);
    }

    #[test]
    fn run_honours_stop() {
        let (mut render, _queue, _master, _conv) = setup();
        let session = SessionState::new();
        session.stop_signal().stop();

        render.run(&session).unwrap();
        assert_eq!(render.surface().presents(), 0);
    }
}
