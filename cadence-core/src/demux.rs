//! Demuxer boundary: stream table plus a "read next compressed unit" call.

use serde::Serialize;

use crate::packet::CompressedUnit;
use crate::source::SourceError;

/// Exact fraction, used for stream time bases and frame rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub const fn new(num: i64, den: i64) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }

    /// Convert raw timestamp ticks in this time base to seconds
    pub fn ticks_to_secs(&self, ticks: i64) -> f64 {
        ticks as f64 * self.as_f64()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Data,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamInfo {
    pub index: u32,
    pub kind: MediaKind,
    pub time_base: Rational,
}

pub trait Demuxer: Send {
    fn streams(&self) -> &[StreamInfo];

    /// Next unit from any stream, `Ok(None)` at end of input
    fn read_unit(&mut self) -> Result<Option<CompressedUnit>, SourceError>;

    fn name(&self) -> &str;
}

/// Pick the video stream to play. With several video streams the last one
/// listed wins.
pub fn select_video_stream(streams: &[StreamInfo]) -> Option<&StreamInfo> {
    streams.iter().rev().find(|s| s.kind == MediaKind::Video)
}
