//! Frame source backed by a directory of still images.

use image::RgbImage;
use liveface_core::frame::{Frame, FrameSource, FrameSourceError};
use std::path::{Path, PathBuf};
use std::time::Duration;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Replays the images of a directory in file-name order at a fixed rate.
pub struct ImageSequenceSource {
    paths: Vec<PathBuf>,
    next: usize,
    emitted: u64,
    interval: Duration,
    looping: bool,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: u32, looping: bool) -> std::io::Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        tracing::info!(dir = %dir.display(), frames = paths.len(), fps, looping, "image sequence opened");
        Ok(Self {
            paths,
            next: 0,
            emitted: 0,
            interval: Duration::from_secs(1) / fps.max(1),
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    fn load(path: &Path) -> Result<RgbImage, FrameSourceError> {
        Ok(image::open(path)?.to_rgb8())
    }
}

impl FrameSource for ImageSequenceSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, FrameSourceError> {
        if self.next >= self.paths.len() {
            if !self.looping || self.paths.is_empty() {
                return Ok(None);
            }
            self.next = 0;
        }

        // Pace like a sensor would
        if self.emitted > 0 {
            std::thread::sleep(self.interval);
        }

        let image = Self::load(&self.paths[self.next])?;
        let timestamp = self.interval * self.emitted as u32;
        self.next += 1;
        self.emitted += 1;
        Ok(Some(Frame::new(image, timestamp)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_frames(dir: &Path, names: &[&str]) {
        std::fs::create_dir_all(dir).unwrap();
        for name in names {
            RgbImage::new(4, 3).save(dir.join(name)).unwrap();
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("liveface-source-{tag}-{}", std::process::id()))
    }

    #[test]
    fn test_replays_in_name_order() {
        let dir = temp_dir("order");
        write_frames(&dir, &["b.png", "a.png"]);
        std::fs::write(dir.join("notes.txt"), "ignored").unwrap();

        let mut source = ImageSequenceSource::open(&dir, 1000, false).unwrap();
        assert_eq!(source.len(), 2);
        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(first.timestamp, Duration::ZERO);
        assert_eq!(second.timestamp, Duration::from_millis(1));
        assert_eq!(first.image.dimensions(), (4, 3));
        assert!(source.next_frame().unwrap().is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_looping_keeps_timestamps_increasing() {
        let dir = temp_dir("loop");
        write_frames(&dir, &["only.png"]);

        let mut source = ImageSequenceSource::open(&dir, 1000, true).unwrap();
        let stamps: Vec<Duration> = (0..3)
            .map(|_| source.next_frame().unwrap().unwrap().timestamp)
            .collect();
        assert_eq!(
            stamps,
            vec![
                Duration::ZERO,
                Duration::from_millis(1),
                Duration::from_millis(2)
            ]
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_empty_directory_ends_immediately() {
        let dir = temp_dir("empty");
        std::fs::create_dir_all(&dir).unwrap();
        let mut source = ImageSequenceSource::open(&dir, 30, true).unwrap();
        assert!(source.is_empty());
        assert!(source.next_frame().unwrap().is_none());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
