//! Motion-JPEG segmenting encoder.
//!
//! Stream layout (all integers big-endian):
//!
//! ```text
//! init:    "LFMJ" | version u8 | width u32 | height u32 | timescale u32
//! segment: "LFSG" | sequence u32 | frame_count u32 | frame*
//! frame:   pts u64 (timescale units) | length u32 | JPEG bytes
//! ```
//!
//! The init segment is emitted with the first frame, once the dimensions
//! are known. A media segment is cut whenever the next frame would push it
//! past the configured segment duration, so every segment decodes on its
//! own given the init segment.

use image::codecs::jpeg::JpegEncoder;
use liveface_core::chunker::{EncoderError, Segment, SegmentEncoder};
use liveface_core::clock::duration_ms;
use liveface_core::frame::Frame;
use std::time::Duration;

pub const INIT_MAGIC: &[u8; 4] = b"LFMJ";
pub const SEGMENT_MAGIC: &[u8; 4] = b"LFSG";
const FORMAT_VERSION: u8 = 1;
/// Milliseconds.
const TIMESCALE: u32 = 1000;

pub struct MjpegSegmenter {
    segment_duration: Duration,
    quality: u8,
    dimensions: Option<(u32, u32)>,
    sequence: u32,
    segment_start: Option<Duration>,
    pending: Vec<(Duration, Vec<u8>)>,
    finished: bool,
}

impl MjpegSegmenter {
    pub fn new(segment_duration: Duration, quality: u8) -> Self {
        Self {
            segment_duration,
            quality: quality.clamp(1, 100),
            dimensions: None,
            sequence: 0,
            segment_start: None,
            pending: Vec::new(),
            finished: false,
        }
    }

    fn init_segment(width: u32, height: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(17);
        out.extend_from_slice(INIT_MAGIC);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(&width.to_be_bytes());
        out.extend_from_slice(&height.to_be_bytes());
        out.extend_from_slice(&TIMESCALE.to_be_bytes());
        out
    }

    /// Package the buffered frames as one media segment.
    fn flush(&mut self) -> Option<Segment> {
        if self.pending.is_empty() {
            return None;
        }
        let frames = std::mem::take(&mut self.pending);
        let payload: usize = frames.iter().map(|(_, jpeg)| jpeg.len() + 12).sum();

        let mut out = Vec::with_capacity(12 + payload);
        out.extend_from_slice(SEGMENT_MAGIC);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&(frames.len() as u32).to_be_bytes());
        for (pts, jpeg) in &frames {
            out.extend_from_slice(&duration_ms(*pts).to_be_bytes());
            out.extend_from_slice(&(jpeg.len() as u32).to_be_bytes());
            out.extend_from_slice(jpeg);
        }

        tracing::debug!(
            sequence = self.sequence,
            frames = frames.len(),
            bytes = out.len(),
            "media segment ready"
        );
        self.sequence += 1;
        self.segment_start = None;
        Some(Segment::Separable(out))
    }

    fn encode_jpeg(&self, frame: &Frame) -> Result<Vec<u8>, EncoderError> {
        let mut buf = Vec::new();
        {
            let mut encoder = JpegEncoder::new_with_quality(&mut buf, self.quality);
            encoder.encode_image(&frame.image)?;
        }
        Ok(buf)
    }
}

impl SegmentEncoder for MjpegSegmenter {
    fn is_ready_for_more_data(&self) -> bool {
        !self.finished
    }

    fn append(&mut self, frame: &Frame, pts: Duration) -> Result<Vec<Segment>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }

        let mut out = Vec::new();
        let size = (frame.width(), frame.height());
        match self.dimensions {
            None => {
                self.dimensions = Some(size);
                out.push(Segment::Initialization(Self::init_segment(size.0, size.1)));
            }
            Some(expected) if expected != size => {
                return Err(EncoderError::FrameSizeChanged {
                    expected,
                    got: size,
                });
            }
            Some(_) => {}
        }

        if let Some(start) = self.segment_start {
            if pts.saturating_sub(start) >= self.segment_duration {
                out.extend(self.flush());
            }
        }

        let jpeg = self.encode_jpeg(frame)?;
        self.segment_start.get_or_insert(pts);
        self.pending.push((pts, jpeg));
        Ok(out)
    }

    fn finish(&mut self) -> Result<Vec<Segment>, EncoderError> {
        if self.finished {
            return Err(EncoderError::Finished);
        }
        self.finished = true;
        Ok(self.flush().into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(w: u32, h: u32) -> Frame {
        Frame::new(RgbImage::new(w, h), Duration::ZERO)
    }

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn be_u32(bytes: &[u8]) -> u32 {
        u32::from_be_bytes(bytes[..4].try_into().unwrap())
    }

    #[test]
    fn test_first_append_emits_init() {
        let mut seg = MjpegSegmenter::new(ms(1000), 80);
        let out = seg.append(&frame(64, 48), ms(0)).unwrap();
        assert_eq!(out.len(), 1);
        let Segment::Initialization(init) = &out[0] else {
            panic!("expected init segment");
        };
        assert_eq!(&init[..4], INIT_MAGIC);
        assert_eq!(init[4], FORMAT_VERSION);
        assert_eq!(be_u32(&init[5..]), 64);
        assert_eq!(be_u32(&init[9..]), 48);
        assert_eq!(be_u32(&init[13..]), TIMESCALE);
    }

    #[test]
    fn test_cuts_segments_by_duration() {
        let mut seg = MjpegSegmenter::new(ms(100), 80);
        let f = frame(16, 16);
        seg.append(&f, ms(0)).unwrap();
        assert!(seg.append(&f, ms(50)).unwrap().is_empty());

        let out = seg.append(&f, ms(100)).unwrap();
        assert_eq!(out.len(), 1);
        let Segment::Separable(media) = &out[0] else {
            panic!("expected media segment");
        };
        assert_eq!(&media[..4], SEGMENT_MAGIC);
        assert_eq!(be_u32(&media[4..]), 0);
        assert_eq!(be_u32(&media[8..]), 2);
        // First frame pts
        assert_eq!(u64::from_be_bytes(media[12..20].try_into().unwrap()), 0);
        // JPEG SOI marker after the length field
        assert_eq!(&media[24..26], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_finish_flushes_remainder() {
        let mut seg = MjpegSegmenter::new(ms(1000), 80);
        let f = frame(16, 16);
        seg.append(&f, ms(0)).unwrap();
        seg.append(&f, ms(33)).unwrap();
        let out = seg.finish().unwrap();
        assert_eq!(out.len(), 1);
        assert!(!seg.is_ready_for_more_data());
        assert!(matches!(
            seg.append(&f, ms(66)),
            Err(EncoderError::Finished)
        ));
    }

    #[test]
    fn test_finish_without_frames_is_empty() {
        let mut seg = MjpegSegmenter::new(ms(1000), 80);
        assert!(seg.finish().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_size_change() {
        let mut seg = MjpegSegmenter::new(ms(1000), 80);
        seg.append(&frame(16, 16), ms(0)).unwrap();
        let err = seg.append(&frame(32, 16), ms(33)).unwrap_err();
        assert!(matches!(
            err,
            EncoderError::FrameSizeChanged {
                expected: (16, 16),
                got: (32, 16)
            }
        ));
    }
}
