//! # Frame Converter
//!
//! Turns raw decoded frames into display-ready buffers:
//!
//! ```text
//!  ◄──────────── stride (multiple of row alignment) ────────────►
//! ┌───────────────────────────────────────────────────┬──────────┐
//! │ padding                                           │          │
//! │   ┌───────────────────────────────────────┐       │  row     │
//! │   │ width x height pixels, channel order  │       │  slack   │
//! │   │ of the display surface                │       │          │
//! │   └───────────────────────────────────────┘       │          │
//! │ padding                                           │          │
//! └───────────────────────────────────────────────────┴──────────┘
//! ```
//!
//! The conversion context is cached and rebuilt only when the source
//! geometry or format changes. Output buffers come from a [`BufferPool`] and
//! go back to it when the [`ConvertedFrame`] is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::decode::{DecodedFrame, PixelFormat};
use crate::error::OutOfMemory;
use crate::render::Rect;

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),
    #[error("Unsupported conversion from {0:?}")]
    Unsupported(PixelFormat),
    #[error("Failed to build conversion context: {0}")]
    Context(String),
    #[error("Invalid source frame: {0}")]
    InvalidFrame(String),
}

// ============================================================================
// Channel order
// ============================================================================

/// Byte order of a packed 4-channel pixel in memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelOrder {
    Argb,
    Abgr,
    Rgba,
    Bgra,
}

impl ChannelOrder {
    /// Resolve from the memory bytes of the surface's native encoding of
    /// RGBA (1, 2, 3, 4).
    pub fn from_probe(bytes: [u8; 4]) -> Self {
        let alpha_first = bytes[0] == 4 || bytes[0] == 0;
        if alpha_first && bytes[1] == 1 {
            Self::Argb
        } else if alpha_first && bytes[1] == 3 {
            Self::Abgr
        } else if bytes[0] == 1 {
            Self::Rgba
        } else {
            Self::Bgra
        }
    }

    /// Byte offsets of `[r, g, b, a]` within a pixel
    pub fn offsets(&self) -> [usize; 4] {
        match self {
            Self::Argb => [1, 2, 3, 0],
            Self::Abgr => [3, 2, 1, 0],
            Self::Rgba => [0, 1, 2, 3],
            Self::Bgra => [2, 1, 0, 3],
        }
    }

    /// Memory bytes of RGBA (1, 2, 3, 4) in this order
    pub fn probe_bytes(&self) -> [u8; 4] {
        let mut bytes = [0u8; 4];
        for (value, offset) in (1u8..=4).zip(self.offsets()) {
            bytes[offset] = value;
        }
        bytes
    }
}

// ============================================================================
// Conversion context
// ============================================================================

/// What a conversion context is built for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversionKey {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl ConversionKey {
    pub fn of(frame: &DecodedFrame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            format: frame.format,
        }
    }
}

/// A prepared conversion from one source geometry/format to packed pixels
pub trait Scaler: Send {
    /// Write `src` into `dst`, one row every `dst_stride` bytes, starting at
    /// `dst[0]`.
    fn scale(&mut self, src: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), ConvertError>;
}

pub trait ScalerFactory: Send {
    fn create(&self, key: ConversionKey, order: ChannelOrder) -> Result<Box<dyn Scaler>, ConvertError>;

    fn name(&self) -> &str;
}

// ============================================================================
// Buffer Pool - Memory Reuse
// ============================================================================

/// Recycles converted-frame allocations between frames
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_retained: usize,
    allocated: AtomicU64,
    recycled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub total_allocated: u64,
    pub total_recycled: u64,
}

impl BufferPool {
    pub fn new(max_retained: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_retained)),
            max_retained,
            allocated: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        }
    }

    /// Zeroed buffer of `len` bytes, reusing a returned allocation when one
    /// is available
    pub fn acquire(&self, len: usize) -> Result<Vec<u8>, OutOfMemory> {
        let recycled = self.buffers.lock().pop();
        let mut buf = match recycled {
            Some(buf) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::new()
            }
        };

        buf.clear();
        buf.try_reserve_exact(len).map_err(|_| OutOfMemory { bytes: len })?;
        buf.resize(len, 0);
        Ok(buf)
    }

    pub fn release(&self, buf: Vec<u8>) {
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_retained {
            buffers.push(buf);
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            available: self.buffers.lock().len(),
            total_allocated: self.allocated.load(Ordering::Relaxed),
            total_recycled: self.recycled.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Converted Frame
// ============================================================================

/// Display-ready frame. Its buffer returns to the pool on drop.
pub struct ConvertedFrame {
    pixels: Vec<u8>,
    /// Padded dimensions of the buffer
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub padding: u32,
    pub order: ChannelOrder,
    /// Presentation time in stream seconds
    pub pts: f64,
    pool: Arc<BufferPool>,
}

impl ConvertedFrame {
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// The picture inside the padding
    pub fn content_rect(&self) -> Rect {
        Rect {
            x: self.padding,
            y: self.padding,
            width: self.width - 2 * self.padding,
            height: self.height - 2 * self.padding,
        }
    }

    /// Pixel at `(x, y)` of the picture as `[r, g, b, a]`, `None` outside
    /// the content rect
    pub fn rgba_at(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        let content = self.content_rect();
        if x >= content.width || y >= content.height {
            return None;
        }
        let row = (y + self.padding) as usize * self.stride;
        let base = row + (x + self.padding) as usize * BYTES_PER_PIXEL;
        let pixel = self.pixels.get(base..base + BYTES_PER_PIXEL)?;
        let [r, g, b, a] = self.order.offsets();
        Some([pixel[r], pixel[g], pixel[b], pixel[a]])
    }
}

impl std::fmt::Debug for ConvertedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("order", &self.order)
            .field("pts", &self.pts)
            .finish()
    }
}

impl Drop for ConvertedFrame {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.pixels));
    }
}

/// Round a row length up to the alignment boundary
pub fn aligned_stride(row_bytes: usize, alignment: usize) -> usize {
    match row_bytes % alignment {
        0 => row_bytes,
        rem => row_bytes + alignment - rem,
    }
}

// ============================================================================
// Converter
// ============================================================================

pub struct FrameConverter {
    factory: Box<dyn ScalerFactory>,
    order: ChannelOrder,
    padding: usize,
    alignment: usize,
    context: Option<(ConversionKey, Box<dyn Scaler>)>,
    pool: Arc<BufferPool>,
    rebuilds: u64,
}

impl FrameConverter {
    /// `order` is probed from the display surface once, at session start.
    pub fn new(
        factory: Box<dyn ScalerFactory>,
        order: ChannelOrder,
        padding: usize,
        alignment: usize,
        pool: Arc<BufferPool>,
    ) -> Self {
        tracing::debug!(
            "Frame converter using {} -> {:?}, padding {}px, rows aligned to {}",
            factory.name(),
            order,
            padding,
            alignment
        );
        Self {
            factory,
            order,
            padding,
            alignment,
            context: None,
            pool,
            rebuilds: 0,
        }
    }

    pub fn channel_order(&self) -> ChannelOrder {
        self.order
    }

    /// Times the conversion context had to be (re)built
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn convert(&mut self, frame: &DecodedFrame, pts: f64) -> Result<ConvertedFrame, ConvertError> {
        frame
            .validate()
            .map_err(|e| ConvertError::InvalidFrame(e.to_string()))?;

        let width = frame.width as usize + self.padding * 2;
        let height = frame.height as usize + self.padding * 2;
        let stride = aligned_stride(width * BYTES_PER_PIXEL, self.alignment);
        let origin = self.padding * stride + self.padding * BYTES_PER_PIXEL;
        let pool = Arc::clone(&self.pool);
        let mut pixels = pool.acquire(stride * height)?;

        let scaled = self
            .context_for(ConversionKey::of(frame))
            .and_then(|scaler| scaler.scale(frame, &mut pixels[origin..], stride));
        if let Err(e) = scaled {
            pool.release(pixels);
            return Err(e);
        }

        Ok(ConvertedFrame {
            pixels,
            width: width as u32,
            height: height as u32,
            stride,
            padding: self.padding as u32,
            order: self.order,
            pts,
            pool,
        })
    }

    fn context_for(&mut self, key: ConversionKey) -> Result<&mut Box<dyn Scaler>, ConvertError> {
        let stale = !matches!(&self.context, Some((cached, _)) if *cached == key);
        if stale {
            tracing::debug!(
                "Building conversion context for {}x{} {:?}",
                key.width,
                key.height,
                key.format
            );
            // Drop the old context first so a failed rebuild leaves nothing cached
            self.context = None;
            let scaler = self.factory.create(key, self.order)?;
            self.context = Some((key, scaler));
            self.rebuilds += 1;
        }
        match self.context.as_mut() {
            Some((_, scaler)) => Ok(scaler),
            None => Err(ConvertError::Context("no conversion context".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Plane;
    use crate::scaler::SoftwareScalerFactory;
    use bytes::Bytes;

    fn rgba_frame(width: u32, height: u32, fill: [u8; 4]) -> DecodedFrame {
        let data: Vec<u8> = fill
            .iter()
            .copied()
            .cycle()
            .take((width * height * 4) as usize)
            .collect();
        DecodedFrame {
            planes: vec![Plane {
                data: Bytes::from(data),
                stride: width as usize * 4,
            }],
            format: PixelFormat::Rgba,
            width,
            height,
            pts: Some(0),
            keyframe: true,
        }
    }

    fn converter(order: ChannelOrder) -> FrameConverter {
        FrameConverter::new(
            Box::new(SoftwareScalerFactory::default()),
            order,
            4,
            16,
            Arc::new(BufferPool::new(8)),
        )
    }

    #[test]
    fn probe_resolves_channel_order() {
        assert_eq!(ChannelOrder::from_probe([4, 1, 2, 3]), ChannelOrder::Argb);
        assert_eq!(ChannelOrder::from_probe([0, 1, 2, 3]), ChannelOrder::Argb);
        assert_eq!(ChannelOrder::from_probe([4, 3, 2, 1]), ChannelOrder::Abgr);
        assert_eq!(ChannelOrder::from_probe([1, 2, 3, 4]), ChannelOrder::Rgba);
        assert_eq!(ChannelOrder::from_probe([3, 2, 1, 4]), ChannelOrder::Bgra);

        for order in [ChannelOrder::Argb, ChannelOrder::Abgr, ChannelOrder::Rgba, ChannelOrder::Bgra] {
            assert_eq!(ChannelOrder::from_probe(order.probe_bytes()), order);
        }
    }

    #[test]
    fn stride_alignment() {
        assert_eq!(aligned_stride(16, 16), 16);
        assert_eq!(aligned_stride(17, 16), 32);
        assert_eq!(aligned_stride(44, 16), 48);
    }

    #[test]
    fn output_geometry_has_padding_and_aligned_rows() {
        let mut conv = converter(ChannelOrder::Rgba);
        let out = conv.convert(&rgba_frame(3, 2, [10, 20, 30, 255]), 1.5).unwrap();

        assert_eq!((out.width, out.height), (11, 10));
        assert_eq!(out.stride, 48);
        assert_eq!(out.stride % 16, 0);
        assert_eq!(out.pixels().len(), 48 * 10);
        assert_eq!(out.pts, 1.5);
        assert_eq!(out.content_rect(), Rect { x: 4, y: 4, width: 3, height: 2 });
    }

    #[test]
    fn padding_stays_zeroed() {
        let mut conv = converter(ChannelOrder::Rgba);
        let out = conv.convert(&rgba_frame(2, 2, [200, 100, 50, 255]), 0.0).unwrap();

        assert_eq!(out.rgba_at(0, 0), Some([200, 100, 50, 255]));
        assert_eq!(out.rgba_at(1, 1), Some([200, 100, 50, 255]));
        assert_eq!(out.rgba_at(2, 0), None);
        assert_eq!(out.rgba_at(0, u32::MAX), None);
        assert!(out.pixels()[..out.stride * 4].iter().all(|&b| b == 0));
        let last_rows = out.stride * (out.height as usize - 4);
        assert!(out.pixels()[last_rows..].iter().all(|&b| b == 0));
    }

    #[test]
    fn writes_in_surface_channel_order() {
        let mut conv = converter(ChannelOrder::Bgra);
        let out = conv.convert(&rgba_frame(1, 1, [1, 2, 3, 4]), 0.0).unwrap();

        let base = 4 * out.stride + 4 * BYTES_PER_PIXEL;
        assert_eq!(&out.pixels()[base..base + 4], &[3, 2, 1, 4]);
        assert_eq!(out.rgba_at(0, 0), Some([1, 2, 3, 4]));
    }

    #[test]
    fn context_is_cached_per_geometry() {
        let mut conv = converter(ChannelOrder::Rgba);
        conv.convert(&rgba_frame(4, 4, [0; 4]), 0.0).unwrap();
        conv.convert(&rgba_frame(4, 4, [0; 4]), 0.04).unwrap();
        assert_eq!(conv.rebuilds(), 1);

        conv.convert(&rgba_frame(8, 4, [0; 4]), 0.08).unwrap();
        assert_eq!(conv.rebuilds(), 2);
        conv.convert(&rgba_frame(8, 4, [0; 4]), 0.12).unwrap();
        assert_eq!(conv.rebuilds(), 2);
    }

    #[test]
    fn buffers_return_to_pool() {
        let mut conv = converter(ChannelOrder::Rgba);
        let pool = Arc::clone(conv.pool());

        let first = conv.convert(&rgba_frame(4, 4, [0; 4]), 0.0).unwrap();
        drop(first);
        assert_eq!(pool.stats().available, 1);

        let _second = conv.convert(&rgba_frame(4, 4, [0; 4]), 0.04).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_allocated, 1);
        assert_eq!(stats.total_recycled, 1);
        assert_eq!(stats.available, 0);
    }

    #[test]
    fn recycled_buffers_are_zeroed() {
        let pool = BufferPool::new(2);
        let mut buf = pool.acquire(8).unwrap();
        buf.fill(0xAA);
        pool.release(buf);

        let buf = pool.acquire(12).unwrap();
        assert_eq!(buf.len(), 12);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn invalid_frame_is_rejected() {
        let mut conv = converter(ChannelOrder::Rgba);
        let mut frame = rgba_frame(4, 4, [0; 4]);
        frame.planes.clear();
        assert!(matches!(conv.convert(&frame, 0.0), Err(ConvertError::InvalidFrame(_))));
    }
}
