//! YUV4MPEG2 container and the pass-through decoder for its frames.
//!
//! ```text
//! YUV4MPEG2 W640 H360 F30000:1001 Ip A1:1 C420jpeg\n
//! FRAME\n <w*h luma> <(w/2)*(h/2) Cb> <(w/2)*(h/2) Cr>
//! FRAME\n ...
//! ```
//!
//! Y4M carries raw pictures, so "decoding" a unit is slicing it into planes.
//! [`RawVideoDecoder`] still honours the send/receive contract, with a single
//! output slot, so it pushes back like a real codec does.

use std::io::{self, BufRead, BufReader, Read};

use bytes::Bytes;
use thiserror::Error;

use crate::decode::{DecodeError, DecodedFrame, Decoder, PixelFormat, Plane, ReceiveStatus, SendStatus};
use crate::demux::{Demuxer, MediaKind, Rational, StreamInfo};
use crate::error::OutOfMemory;
use crate::packet::CompressedUnit;
use crate::source::{ByteSource, SourceError, SourceReader};

const SIGNATURE: &str = "YUV4MPEG2";
const FRAME_MARKER: &[u8] = b"FRAME";
const MAX_HEADER_LINE: u64 = 4096;
/// Largest picture accepted from a header, with room for 8K 4:2:0
const MAX_FRAME_BYTES: usize = 1 << 27;

#[derive(Debug, Error)]
pub enum Y4mError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("Not a YUV4MPEG2 stream")]
    BadSignature,
    #[error("Malformed header: {0}")]
    BadHeader(String),
    #[error("Unsupported colour space: {0}")]
    UnsupportedColorspace(String),
}

impl From<io::Error> for Y4mError {
    fn from(e: io::Error) -> Self {
        Self::Source(SourceError::Io(e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: u32,
    pub height: u32,
    pub frame_rate: Rational,
}

impl Y4mHeader {
    pub fn parse(line: &str) -> Result<Self, Y4mError> {
        let mut tokens = line.split_ascii_whitespace();
        if tokens.next() != Some(SIGNATURE) {
            return Err(Y4mError::BadSignature);
        }

        let mut width = None;
        let mut height = None;
        let mut frame_rate = Rational::new(25, 1);

        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = Some(parse_number(value, "width")?),
                Some('H') => height = Some(parse_number(value, "height")?),
                Some('F') => frame_rate = parse_ratio(value)?,
                Some('C') => {
                    if !matches!(value, "420" | "420jpeg" | "420paldv" | "420mpeg2") {
                        return Err(Y4mError::UnsupportedColorspace(value.to_string()));
                    }
                }
                // Interlacing, aspect ratio, comments and extensions
                _ => {}
            }
        }

        let width = width.ok_or_else(|| Y4mError::BadHeader("missing width".into()))?;
        let height = height.ok_or_else(|| Y4mError::BadHeader("missing height".into()))?;
        if width == 0 || height == 0 {
            return Err(Y4mError::BadHeader(format!("empty picture {}x{}", width, height)));
        }

        let header = Self {
            width,
            height,
            frame_rate,
        };
        match header.frame_size() {
            Some(size) if size <= MAX_FRAME_BYTES => Ok(header),
            _ => Err(Y4mError::BadHeader(format!("picture {}x{} too large", width, height))),
        }
    }

    /// Bytes in one picture, `None` if that overflows `usize`
    pub fn frame_size(&self) -> Option<usize> {
        PixelFormat::Yuv420p.frame_size(self.width as usize, self.height as usize)
    }

    /// One tick per frame
    pub fn time_base(&self) -> Rational {
        Rational::new(self.frame_rate.den, self.frame_rate.num)
    }

    pub fn decoder(&self) -> RawVideoDecoder {
        RawVideoDecoder::new(self.width, self.height, PixelFormat::Yuv420p)
    }
}

fn parse_number(value: &str, what: &str) -> Result<u32, Y4mError> {
    value
        .parse()
        .map_err(|_| Y4mError::BadHeader(format!("bad {}: {:?}", what, value)))
}

fn parse_ratio(value: &str) -> Result<Rational, Y4mError> {
    let (num, den) = value
        .split_once(':')
        .ok_or_else(|| Y4mError::BadHeader(format!("bad frame rate: {:?}", value)))?;
    let num = parse_number(num, "frame rate")?;
    let den = parse_number(den, "frame rate")?;
    if num == 0 || den == 0 {
        return Err(Y4mError::BadHeader(format!("bad frame rate: {:?}", value)));
    }
    Ok(Rational::new(num as i64, den as i64))
}

// ============================================================================
// Demuxer
// ============================================================================

pub struct Y4mDemuxer<S> {
    reader: BufReader<SourceReader<S>>,
    header: Y4mHeader,
    streams: Vec<StreamInfo>,
    frame_index: i64,
    line: Vec<u8>,
}

impl<S: ByteSource> Y4mDemuxer<S> {
    pub fn open(source: S) -> Result<Self, Y4mError> {
        let mut reader = BufReader::new(SourceReader::new(source));
        let mut line = Vec::new();
        read_line(&mut reader, &mut line)?;
        let text = std::str::from_utf8(&line).map_err(|_| Y4mError::BadSignature)?;
        let header = Y4mHeader::parse(text)?;

        tracing::info!(
            "Y4M stream {}x{} at {}/{} fps",
            header.width,
            header.height,
            header.frame_rate.num,
            header.frame_rate.den
        );

        Ok(Self {
            reader,
            streams: vec![StreamInfo {
                index: 0,
                kind: MediaKind::Video,
                time_base: header.time_base(),
            }],
            header,
            frame_index: 0,
            line,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }
}

/// Read one `\n`-terminated line (without the newline), bounded in length
fn read_line<R: BufRead>(reader: &mut R, line: &mut Vec<u8>) -> io::Result<usize> {
    line.clear();
    let n = (&mut *reader).take(MAX_HEADER_LINE).read_until(b'\n', line)?;
    if line.last() == Some(&b'\n') {
        line.pop();
    } else if n as u64 == MAX_HEADER_LINE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "header line too long"));
    }
    Ok(n)
}

impl<S: ByteSource> Demuxer for Y4mDemuxer<S> {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn read_unit(&mut self) -> Result<Option<CompressedUnit>, SourceError> {
        if read_line(&mut self.reader, &mut self.line)? == 0 {
            return Ok(None);
        }
        if !self.line.starts_with(FRAME_MARKER) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected FRAME marker before frame {}", self.frame_index),
            )
            .into());
        }

        let size = self
            .header
            .frame_size()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "frame size overflows"))?;
        let mut data = Vec::new();
        if data.try_reserve_exact(size).is_err() {
            // Step over the picture so the next read starts at a FRAME marker
            io::copy(&mut (&mut self.reader).take(size as u64), &mut io::sink())?;
            self.frame_index += 1;
            return Err(OutOfMemory { bytes: size }.into());
        }
        data.resize(size, 0);
        self.reader.read_exact(&mut data)?;

        let index = self.frame_index;
        self.frame_index += 1;
        Ok(Some(
            CompressedUnit::new(0, data)
                .with_timestamps(Some(index), Some(index))
                .with_keyframe(true),
        ))
    }

    fn name(&self) -> &str {
        "y4m"
    }
}

// ============================================================================
// Raw decoder
// ============================================================================

/// Decoder for uncompressed units: each unit is exactly one picture
pub struct RawVideoDecoder {
    width: u32,
    height: u32,
    format: PixelFormat,
    slot: Option<DecodedFrame>,
    end_of_input: bool,
}

impl RawVideoDecoder {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            slot: None,
            end_of_input: false,
        }
    }

    fn split(&self, data: &Bytes) -> Option<Vec<Plane>> {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut offset = 0;
        (0..self.format.plane_count())
            .map(|i| {
                let (row, rows) = self.format.plane_extent(i, w, h)?;
                let len = row.checked_mul(rows)?;
                let plane = data.slice(offset..offset + len);
                offset += len;
                Some(Plane { data: plane, stride: row })
            })
            .collect()
    }
}

impl Decoder for RawVideoDecoder {
    fn send(&mut self, unit: &CompressedUnit) -> Result<SendStatus, DecodeError> {
        if self.end_of_input {
            return Ok(SendStatus::EndOfStream);
        }
        if self.slot.is_some() {
            return Ok(SendStatus::NeedsMoreInput);
        }

        let too_large = || {
            DecodeError::UnsupportedFormat(format!("{}x{} {:?} is too large", self.width, self.height, self.format))
        };
        let expected = self
            .format
            .frame_size(self.width as usize, self.height as usize)
            .ok_or_else(too_large)?;
        if unit.data.len() != expected {
            return Err(DecodeError::Corrupt {
                expected,
                actual: unit.data.len(),
            });
        }

        self.slot = Some(DecodedFrame {
            planes: self.split(&unit.data).ok_or_else(too_large)?,
            format: self.format,
            width: self.width,
            height: self.height,
            pts: unit.pts.or(unit.dts),
            keyframe: unit.keyframe,
        });
        Ok(SendStatus::Accepted)
    }

    fn receive(&mut self) -> Result<ReceiveStatus, DecodeError> {
        Ok(match self.slot.take() {
            Some(frame) => ReceiveStatus::Frame(frame),
            None => ReceiveStatus::NeedsMoreInput,
        })
    }

    fn signal_end_of_input(&mut self) {
        self.end_of_input = true;
    }

    fn name(&self) -> &str {
        "rawvideo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemorySource;

    fn y4m_bytes(width: u32, height: u32, frames: u8) -> Vec<u8> {
        let mut out = format!("YUV4MPEG2 W{} H{} F30000:1001 Ip A1:1 C420jpeg\n", width, height).into_bytes();
        let size = PixelFormat::Yuv420p.frame_size(width as usize, height as usize).unwrap();
        for i in 0..frames {
            out.extend_from_slice(b"FRAME\n");
            out.extend(std::iter::repeat(i).take(size));
        }
        out
    }

    #[test]
    fn parses_header() {
        let header = Y4mHeader::parse("YUV4MPEG2 W640 H360 F30000:1001 Ip A1:1 C420paldv XYSCSS=420PALDV").unwrap();
        assert_eq!((header.width, header.height), (640, 360));
        assert_eq!(header.frame_rate, Rational::new(30000, 1001));
        assert_eq!(header.time_base(), Rational::new(1001, 30000));
        assert_eq!(header.frame_size(), Some(640 * 360 * 3 / 2));
    }

    #[test]
    fn rejects_bad_headers() {
        assert!(matches!(Y4mHeader::parse("RIFF W2 H2"), Err(Y4mError::BadSignature)));
        assert!(matches!(Y4mHeader::parse("YUV4MPEG2 H2"), Err(Y4mError::BadHeader(_))));
        assert!(matches!(
            Y4mHeader::parse("YUV4MPEG2 W2 H2 C444"),
            Err(Y4mError::UnsupportedColorspace(_))
        ));
        assert!(matches!(Y4mHeader::parse("YUV4MPEG2 W2 H2 F0:1"), Err(Y4mError::BadHeader(_))));
    }

    #[test]
    fn rejects_oversized_pictures() {
        // Overflows the byte count on every target
        assert!(matches!(
            Y4mHeader::parse("YUV4MPEG2 W4294967295 H4294967295 F25:1"),
            Err(Y4mError::BadHeader(_))
        ));
        // Fits in usize but no sane allocation
        assert!(matches!(
            Y4mHeader::parse("YUV4MPEG2 W65536 H65536 F25:1"),
            Err(Y4mError::BadHeader(_))
        ));
        assert!(Y4mHeader::parse("YUV4MPEG2 W7680 H4320 F25:1").is_ok());

        let mut bytes = b"YUV4MPEG2 W4294967295 H4294967295 F25:1\nFRAME\n".to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        assert!(matches!(
            Y4mDemuxer::open(MemorySource::from_bytes(bytes)),
            Err(Y4mError::BadHeader(_))
        ));
    }

    #[test]
    fn raw_decoder_refuses_unrepresentable_geometry() {
        let mut decoder = RawVideoDecoder::new(u32::MAX, u32::MAX, PixelFormat::Rgba);
        let unit = CompressedUnit::new(0, vec![0u8; 4]);
        assert!(matches!(decoder.send(&unit), Err(DecodeError::UnsupportedFormat(_))));
    }

    #[test]
    fn yields_one_unit_per_frame() {
        let source = MemorySource::from_bytes(y4m_bytes(4, 2, 3));
        let mut demuxer = Y4mDemuxer::open(source).unwrap();
        assert_eq!(demuxer.streams().len(), 1);
        assert_eq!(demuxer.streams()[0].time_base, Rational::new(1001, 30000));

        for i in 0..3u8 {
            let unit = demuxer.read_unit().unwrap().unwrap();
            assert_eq!(unit.len(), 12);
            assert_eq!(unit.pts, Some(i as i64));
            assert!(unit.data.iter().all(|&b| b == i));
        }
        assert!(demuxer.read_unit().unwrap().is_none());
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut bytes = y4m_bytes(4, 2, 1);
        bytes.truncate(bytes.len() - 3);
        let mut demuxer = Y4mDemuxer::open(MemorySource::from_bytes(bytes)).unwrap();
        assert!(matches!(demuxer.read_unit(), Err(SourceError::Io(_))));
    }

    #[test]
    fn raw_decoder_pushes_back_until_drained() {
        let header = Y4mHeader::parse("YUV4MPEG2 W4 H2 F25:1").unwrap();
        let mut decoder = header.decoder();
        let unit = CompressedUnit::new(0, vec![7u8; 12]).with_timestamps(Some(3), Some(3));

        assert_eq!(decoder.send(&unit).unwrap(), SendStatus::Accepted);
        assert_eq!(decoder.send(&unit).unwrap(), SendStatus::NeedsMoreInput);

        match decoder.receive().unwrap() {
            ReceiveStatus::Frame(frame) => {
                assert_eq!(frame.pts, Some(3));
                assert_eq!(frame.planes.len(), 3);
                assert_eq!(frame.planes[0].data.len(), 8);
                assert_eq!(frame.planes[1].stride, 2);
                assert!(frame.validate().is_ok());
            }
            ReceiveStatus::NeedsMoreInput => panic!("frame expected"),
        }
        assert!(matches!(decoder.receive().unwrap(), ReceiveStatus::NeedsMoreInput));

        decoder.signal_end_of_input();
        assert_eq!(decoder.send(&unit).unwrap(), SendStatus::EndOfStream);
    }

    #[test]
    fn raw_decoder_rejects_short_units() {
        let mut decoder = RawVideoDecoder::new(4, 2, PixelFormat::Yuv420p);
        let unit = CompressedUnit::new(0, vec![0u8; 5]);
        assert!(matches!(
            decoder.send(&unit),
            Err(DecodeError::Corrupt { expected: 12, actual: 5 })
        ));
    }
}
