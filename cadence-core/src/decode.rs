//! # Video Decode Module
//!
//! Decoder boundary plus the adapter that feeds it.
//!
//! The adapter pulls units from the [`Demuxer`], keeps the ones belonging to
//! the selected video stream in a [`PacketQueue`], and drives the
//! send/receive cycle of the external [`Decoder`] until one raw frame comes
//! out. Anything unrecoverable marks the session finished.

use bytes::Bytes;
use thiserror::Error;

use crate::demux::{Demuxer, Rational, StreamInfo};
use crate::error::PlaybackError;
use crate::packet::{CompressedUnit, PacketQueue};
use crate::session::{EndReason, SessionState};
use crate::source::SourceError;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Unsupported pixel format: {0}")]
    UnsupportedFormat(String),
    #[error("Decode failed: {0}")]
    DecodeFailed(String),
    #[error("Corrupt unit: expected {expected} bytes, got {actual}")]
    Corrupt { expected: usize, actual: usize },
    #[error("Decoder stalled after {attempts} needs-more-input answers")]
    Stalled { attempts: u32 },
    #[error("Video is {behind_secs:.2}s behind playback")]
    Lagging { behind_secs: f64 },
}

/// Pixel layout of decoded frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// Planar 4:2:0 (Y + U + V)
    Yuv420p,
    /// Semi-planar 4:2:0 (Y + interleaved UV)
    Nv12,
    Rgb24,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            Self::Yuv420p => 3,
            Self::Nv12 => 2,
            Self::Rgb24 | Self::Rgba | Self::Bgra => 1,
        }
    }

    /// `(bytes per row, rows)` of a tightly packed plane, `None` if the row
    /// length does not fit in `usize`
    pub fn plane_extent(&self, index: usize, width: usize, height: usize) -> Option<(usize, usize)> {
        let chroma_w = width.div_ceil(2);
        let chroma_h = height.div_ceil(2);
        match (self, index) {
            (Self::Yuv420p, 0) | (Self::Nv12, 0) => Some((width, height)),
            (Self::Yuv420p, _) => Some((chroma_w, chroma_h)),
            (Self::Nv12, _) => Some((chroma_w.checked_mul(2)?, chroma_h)),
            (Self::Rgb24, _) => Some((width.checked_mul(3)?, height)),
            (Self::Rgba, _) | (Self::Bgra, _) => Some((width.checked_mul(4)?, height)),
        }
    }

    /// Bytes in one tightly packed picture, `None` on overflow
    pub fn frame_size(&self, width: usize, height: usize) -> Option<usize> {
        (0..self.plane_count()).try_fold(0usize, |total, i| {
            let (row, rows) = self.plane_extent(i, width, height)?;
            total.checked_add(row.checked_mul(rows)?)
        })
    }
}

#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Bytes,
    /// Bytes between the starts of consecutive rows
    pub stride: usize,
}

/// One fully decoded, raw-pixel video frame
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub planes: Vec<Plane>,
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// Best-effort presentation timestamp in stream time-base ticks
    pub pts: Option<i64>,
    pub keyframe: bool,
}

impl DecodedFrame {
    /// Check that every plane the format needs is present and large enough.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let (w, h) = (self.width as usize, self.height as usize);
        if self.planes.len() < self.format.plane_count() {
            return Err(DecodeError::DecodeFailed(format!(
                "{:?} frame has {} planes",
                self.format,
                self.planes.len()
            )));
        }
        for (i, plane) in self.planes.iter().take(self.format.plane_count()).enumerate() {
            let (row, needed) = self
                .format
                .plane_extent(i, w, h)
                .and_then(|(row, rows)| {
                    let needed = match rows {
                        0 => 0,
                        _ => plane.stride.checked_mul(rows - 1)?.checked_add(row)?,
                    };
                    Some((row, needed))
                })
                .ok_or_else(|| {
                    DecodeError::DecodeFailed(format!("plane {} of a {}x{} frame overflows", i, w, h))
                })?;
            if plane.stride < row || plane.data.len() < needed {
                return Err(DecodeError::Corrupt {
                    expected: needed,
                    actual: plane.data.len(),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Decoder boundary
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Unit consumed
    Accepted,
    /// Decoder must be drained before it takes this unit
    NeedsMoreInput,
    /// Decoder has been told input ended and takes no more units
    EndOfStream,
}

#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedFrame),
    NeedsMoreInput,
}

/// Decoder trait - implemented by codec backends. Errors are fatal for the
/// stream.
pub trait Decoder: Send {
    fn send(&mut self, unit: &CompressedUnit) -> Result<SendStatus, DecodeError>;

    fn receive(&mut self) -> Result<ReceiveStatus, DecodeError>;

    /// No more units will be sent; buffered frames may still be received.
    fn signal_end_of_input(&mut self) {}

    fn name(&self) -> &str;
}

// ============================================================================
// Demux/Decode Adapter
// ============================================================================

#[derive(Debug)]
pub enum DecodeOutcome {
    Frame(DecodedFrame),
    EndOfStream,
    Fatal(PlaybackError),
}

pub struct DecodeAdapter {
    demuxer: Box<dyn Demuxer>,
    decoder: Box<dyn Decoder>,
    packets: PacketQueue,
    stream: StreamInfo,
    max_retries: u32,
    draining: bool,
    frames_decoded: u64,
    units_discarded: u64,
}

impl DecodeAdapter {
    pub fn new(
        demuxer: Box<dyn Demuxer>,
        decoder: Box<dyn Decoder>,
        stream: StreamInfo,
        max_retries: u32,
    ) -> Self {
        tracing::info!(
            "Decoding stream {} from {} with {}",
            stream.index,
            demuxer.name(),
            decoder.name()
        );
        Self {
            demuxer,
            decoder,
            packets: PacketQueue::new(),
            stream,
            max_retries,
            draining: false,
            frames_decoded: 0,
            units_discarded: 0,
        }
    }

    pub fn time_base(&self) -> Rational {
        self.stream.time_base
    }

    pub fn stream(&self) -> &StreamInfo {
        &self.stream
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Units thrown away because they belonged to another stream or arrived
    /// after the session finished
    pub fn units_discarded(&self) -> u64 {
        self.units_discarded
    }

    pub fn queued_units(&self) -> usize {
        self.packets.len()
    }

    /// Run the send/receive cycle until one frame is produced, input ends,
    /// or the stream fails.
    pub fn decode_next_frame(&mut self, session: &SessionState) -> DecodeOutcome {
        let mut starved = 0u32;

        loop {
            if session.is_finished() {
                return DecodeOutcome::EndOfStream;
            }

            if self.draining {
                return match self.decoder.receive() {
                    Ok(ReceiveStatus::Frame(frame)) => self.emit(frame),
                    Ok(ReceiveStatus::NeedsMoreInput) => {
                        tracing::debug!("Decoder drained after {} frames", self.frames_decoded);
                        session.finish(EndReason::EndOfStream);
                        DecodeOutcome::EndOfStream
                    }
                    Err(e) => self.fail(session, e),
                };
            }

            if self.packets.is_empty() {
                match self.fill(session) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!("Demuxer exhausted, draining {}", self.decoder.name());
                        self.decoder.signal_end_of_input();
                        self.draining = true;
                        continue;
                    }
                    Err(e) => {
                        tracing::error!("Reading {} failed: {}", self.demuxer.name(), e);
                        session.finish(EndReason::IoFatal(e.to_string()));
                        return DecodeOutcome::Fatal(e.into());
                    }
                }
            }

            if let Some(unit) = self.packets.peek_front() {
                match self.decoder.send(unit) {
                    Ok(SendStatus::Accepted) => {
                        self.packets.dequeue_front();
                    }
                    // Head stays queued and is offered again next round
                    Ok(SendStatus::NeedsMoreInput) | Ok(SendStatus::EndOfStream) => {}
                    Err(e) => return self.fail(session, e),
                }
            }

            match self.decoder.receive() {
                Ok(ReceiveStatus::Frame(frame)) => return self.emit(frame),
                Ok(ReceiveStatus::NeedsMoreInput) => {
                    starved += 1;
                    if starved > self.max_retries {
                        return self.fail(session, DecodeError::Stalled { attempts: starved });
                    }
                }
                Err(e) => return self.fail(session, e),
            }
        }
    }

    /// Read until one unit of the target stream is queued. `Ok(false)` once
    /// the demuxer has nothing left.
    fn fill(&mut self, session: &SessionState) -> Result<bool, SourceError> {
        while self.packets.is_empty() {
            let unit = match self.demuxer.read_unit() {
                Ok(Some(unit)) => unit,
                Ok(None) => return Ok(false),
                Err(SourceError::OutOfMemory(e)) => {
                    tracing::warn!("Skipping compressed unit: {}", e);
                    session.counters().record_oom();
                    continue;
                }
                Err(e) => return Err(e),
            };

            if unit.stream_index != self.stream.index || session.is_finished() {
                self.units_discarded += 1;
                continue;
            }

            if let Err(e) = self.packets.enqueue(unit) {
                tracing::warn!("Dropping compressed unit: {}", e);
                session.counters().record_oom();
            }
        }
        Ok(true)
    }

    fn emit(&mut self, frame: DecodedFrame) -> DecodeOutcome {
        self.frames_decoded += 1;
        session_trace(&frame, self.frames_decoded);
        DecodeOutcome::Frame(frame)
    }

    fn fail(&mut self, session: &SessionState, err: DecodeError) -> DecodeOutcome {
        tracing::error!("{} failed: {}", self.decoder.name(), err);
        session.finish(EndReason::DecodeFatal(err.to_string()));
        self.packets.clear();
        DecodeOutcome::Fatal(err.into())
    }
}

fn session_trace(frame: &DecodedFrame, count: u64) {
    if count % 120 == 1 {
        tracing::debug!(
            "Decoded frame #{}: {}x{} {:?} pts={:?}",
            count,
            frame.width,
            frame.height,
            frame.format,
            frame.pts
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::MediaKind;
    use crate::error::OutOfMemory;
    use std::collections::VecDeque;

    struct ScriptedDemuxer {
        streams: Vec<StreamInfo>,
        units: VecDeque<Result<CompressedUnit, SourceError>>,
    }

    impl ScriptedDemuxer {
        fn new(units: Vec<CompressedUnit>) -> Self {
            Self {
                streams: vec![
                    StreamInfo {
                        index: 0,
                        kind: MediaKind::Video,
                        time_base: Rational::new(1, 1),
                    },
                    StreamInfo {
                        index: 1,
                        kind: MediaKind::Audio,
                        time_base: Rational::new(1, 48000),
                    },
                ],
                units: units.into_iter().map(Ok).collect(),
            }
        }
    }

    impl Demuxer for ScriptedDemuxer {
        fn streams(&self) -> &[StreamInfo] {
            &self.streams
        }

        fn read_unit(&mut self) -> Result<Option<CompressedUnit>, SourceError> {
            self.units.pop_front().transpose()
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct ScriptedDecoder {
        sends: VecDeque<Result<SendStatus, DecodeError>>,
        receives: VecDeque<Result<Option<i64>, DecodeError>>,
        sent: Vec<i64>,
        eoi: bool,
    }

    impl Decoder for ScriptedDecoder {
        fn send(&mut self, unit: &CompressedUnit) -> Result<SendStatus, DecodeError> {
            let status = self.sends.pop_front().unwrap_or(Ok(SendStatus::Accepted));
            if matches!(status, Ok(SendStatus::Accepted)) {
                self.sent.push(unit.dts.unwrap_or(-1));
            }
            status
        }

        fn receive(&mut self) -> Result<ReceiveStatus, DecodeError> {
            match self.receives.pop_front() {
                Some(Ok(Some(pts))) => Ok(ReceiveStatus::Frame(frame(pts))),
                Some(Ok(None)) | None => Ok(ReceiveStatus::NeedsMoreInput),
                Some(Err(e)) => Err(e),
            }
        }

        fn signal_end_of_input(&mut self) {
            self.eoi = true;
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn frame(pts: i64) -> DecodedFrame {
        DecodedFrame {
            planes: vec![Plane {
                data: Bytes::from(vec![0u8; 16]),
                stride: 8,
            }],
            format: PixelFormat::Rgba,
            width: 2,
            height: 2,
            pts: Some(pts),
            keyframe: true,
        }
    }

    fn video(dts: i64) -> CompressedUnit {
        CompressedUnit::new(0, vec![1, 2, 3]).with_timestamps(Some(dts), Some(dts))
    }

    fn audio() -> CompressedUnit {
        CompressedUnit::new(1, vec![9; 4])
    }

    fn adapter(units: Vec<CompressedUnit>, decoder: ScriptedDecoder) -> DecodeAdapter {
        let demuxer = ScriptedDemuxer::new(units);
        let stream = demuxer.streams[0].clone();
        DecodeAdapter::new(Box::new(demuxer), Box::new(decoder), stream, 8)
    }

    #[test]
    fn one_frame_per_accepted_unit() {
        let decoder = ScriptedDecoder {
            receives: (0..3).map(|p| Ok(Some(p))).collect(),
            ..Default::default()
        };
        let mut adapter = adapter((0..3).map(video).collect(), decoder);
        let session = SessionState::new();

        for expected in 0..3 {
            match adapter.decode_next_frame(&session) {
                DecodeOutcome::Frame(f) => assert_eq!(f.pts, Some(expected)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(adapter.frames_decoded(), 3);
        assert!(!session.is_finished());
    }

    #[test]
    fn other_streams_are_discarded() {
        let decoder = ScriptedDecoder {
            receives: vec![Ok(Some(0))].into(),
            ..Default::default()
        };
        let mut adapter = adapter(vec![audio(), audio(), video(0)], decoder);
        let session = SessionState::new();

        assert!(matches!(adapter.decode_next_frame(&session), DecodeOutcome::Frame(_)));
        assert_eq!(adapter.units_discarded(), 2);
        assert_eq!(adapter.queued_units(), 0);
    }

    #[test]
    fn rejected_head_is_resent() {
        let decoder = ScriptedDecoder {
            sends: vec![Ok(SendStatus::NeedsMoreInput), Ok(SendStatus::Accepted)].into(),
            receives: vec![Ok(None), Ok(Some(7))].into(),
            ..Default::default()
        };
        let mut adapter = adapter(vec![video(7), video(8)], decoder);
        let session = SessionState::new();

        match adapter.decode_next_frame(&session) {
            DecodeOutcome::Frame(f) => assert_eq!(f.pts, Some(7)),
            other => panic!("unexpected {:?}", other),
        }
        // Unit 8 was never read: the queue only refills when empty
        assert_eq!(adapter.queued_units(), 0);
    }

    #[test]
    fn fatal_send_finishes_session() {
        let decoder = ScriptedDecoder {
            sends: vec![Err(DecodeError::DecodeFailed("bad header".into()))].into(),
            ..Default::default()
        };
        let mut adapter = adapter(vec![video(0)], decoder);
        let session = SessionState::new();

        assert!(matches!(
            adapter.decode_next_frame(&session),
            DecodeOutcome::Fatal(PlaybackError::DecodeFatal(_))
        ));
        assert!(session.is_finished());
        assert!(session.has_fatal_error());
    }

    #[test]
    fn endless_needs_more_input_is_bounded() {
        let mut adapter = adapter((0..100).map(video).collect(), ScriptedDecoder::default());
        let session = SessionState::new();

        match adapter.decode_next_frame(&session) {
            DecodeOutcome::Fatal(PlaybackError::DecodeFatal(DecodeError::Stalled { attempts })) => {
                assert_eq!(attempts, 9)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(session.is_finished());
    }

    #[test]
    fn end_of_input_drains_decoder() {
        let decoder = ScriptedDecoder {
            receives: vec![Ok(None), Ok(Some(0)), Ok(Some(1))].into(),
            ..Default::default()
        };
        let mut adapter = adapter(vec![video(0)], decoder);
        let session = SessionState::new();

        // The single unit is buffered, then end of input flushes two frames out
        assert!(matches!(adapter.decode_next_frame(&session), DecodeOutcome::Frame(_)));
        assert!(matches!(adapter.decode_next_frame(&session), DecodeOutcome::Frame(_)));
        assert!(matches!(adapter.decode_next_frame(&session), DecodeOutcome::EndOfStream));
        assert_eq!(session.end_reason(), Some(EndReason::EndOfStream));
        assert!(!session.has_fatal_error());
    }

    #[test]
    fn read_failure_is_io_fatal() {
        let mut demuxer = ScriptedDemuxer::new(vec![]);
        demuxer
            .units
            .push_back(Err(SourceError::Io(std::io::Error::other("disk gone"))));
        let stream = demuxer.streams[0].clone();
        let mut adapter = DecodeAdapter::new(
            Box::new(demuxer),
            Box::new(ScriptedDecoder::default()),
            stream,
            8,
        );
        let session = SessionState::new();

        assert!(matches!(
            adapter.decode_next_frame(&session),
            DecodeOutcome::Fatal(PlaybackError::IoFatal(_))
        ));
        assert!(matches!(session.end_reason(), Some(EndReason::IoFatal(_))));
    }

    #[test]
    fn unit_too_large_to_buffer_is_skipped() {
        let mut demuxer = ScriptedDemuxer::new(vec![video(4)]);
        demuxer
            .units
            .push_front(Err(SourceError::OutOfMemory(OutOfMemory { bytes: 1 << 30 })));
        let stream = demuxer.streams[0].clone();
        let decoder = ScriptedDecoder {
            receives: vec![Ok(Some(4))].into(),
            ..Default::default()
        };
        let mut adapter = DecodeAdapter::new(Box::new(demuxer), Box::new(decoder), stream, 8);
        let session = SessionState::new();

        match adapter.decode_next_frame(&session) {
            DecodeOutcome::Frame(f) => assert_eq!(f.pts, Some(4)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!session.is_finished());
        assert_eq!(session.counters().snapshot().oom_skips, 1);
    }

    #[test]
    fn plane_validation() {
        let mut f = frame(0);
        assert!(f.validate().is_ok());

        f.planes[0].data = Bytes::from(vec![0u8; 10]);
        assert!(matches!(f.validate(), Err(DecodeError::Corrupt { expected: 16, actual: 10 })));
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 4), Some(16 + 4 + 4));
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), Some(9 + 4 + 4));
        assert_eq!(PixelFormat::Nv12.frame_size(4, 2), Some(8 + 4));
        assert_eq!(PixelFormat::Bgra.frame_size(2, 2), Some(16));
    }

    #[test]
    fn oversized_geometry_does_not_overflow() {
        assert_eq!(PixelFormat::Yuv420p.frame_size(usize::MAX, 2), None);
        assert_eq!(PixelFormat::Rgba.plane_extent(0, usize::MAX / 2, 1), None);

        let mut f = frame(0);
        f.width = u32::MAX;
        f.height = u32::MAX;
        f.planes[0].stride = usize::MAX;
        assert!(matches!(f.validate(), Err(DecodeError::DecodeFailed(_))));
    }
}
