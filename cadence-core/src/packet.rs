//! Compressed units and the queue that holds them until the decoder takes them.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::OutOfMemory;

/// One demuxed, still-encoded chunk of stream data
#[derive(Debug, Clone)]
pub struct CompressedUnit {
    pub data: Bytes,
    pub stream_index: u32,
    /// Decode timestamp in stream time-base ticks
    pub dts: Option<i64>,
    /// Presentation timestamp in stream time-base ticks
    pub pts: Option<i64>,
    pub keyframe: bool,
}

impl CompressedUnit {
    pub fn new(stream_index: u32, data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            stream_index,
            dts: None,
            pts: None,
            keyframe: false,
        }
    }

    pub fn with_timestamps(mut self, dts: Option<i64>, pts: Option<i64>) -> Self {
        self.dts = dts;
        self.pts = pts;
        self
    }

    pub fn with_keyframe(mut self, keyframe: bool) -> Self {
        self.keyframe = keyframe;
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// FIFO of units waiting for the decoder.
///
/// Unbounded on purpose: the decode adapter only reads ahead when it still
/// needs a frame, which keeps the queue short in practice.
#[derive(Debug, Default)]
pub struct PacketQueue {
    units: VecDeque<CompressedUnit>,
    bytes: usize,
}

impl PacketQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the tail. On allocation failure the unit is dropped.
    pub fn enqueue(&mut self, unit: CompressedUnit) -> Result<(), OutOfMemory> {
        if self.units.try_reserve(1).is_err() {
            return Err(OutOfMemory {
                bytes: std::mem::size_of::<CompressedUnit>(),
            });
        }
        self.bytes += unit.len();
        self.units.push_back(unit);
        Ok(())
    }

    pub fn dequeue_front(&mut self) -> Option<CompressedUnit> {
        let unit = self.units.pop_front()?;
        self.bytes -= unit.len();
        Some(unit)
    }

    pub fn peek_front(&self) -> Option<&CompressedUnit> {
        self.units.front()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Payload bytes currently held
    pub fn bytes_queued(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.units.clear();
        self.bytes = 0;
    }
}
