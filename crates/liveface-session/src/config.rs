use liveface_core::clock::duration_ms;
use liveface_core::detector::{
    DetectorConfig, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MERGE_IOU_THRESHOLD,
};
use liveface_core::frame::{FrameOrientation, Rotation};
use liveface_core::instructor::DEFAULT_HYSTERESIS_FRAMES;
use std::path::PathBuf;
use std::time::Duration;

/// Session configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Path to the BlazeFace short-range ONNX model.
    pub model_path: PathBuf,
    /// Minimum detector confidence for a face candidate.
    pub confidence_threshold: f32,
    /// IOU at which overlapping candidates are merged into one face.
    pub merge_iou_threshold: f32,
    /// Largest landmark-derived face width (fraction of the frame) accepted
    /// before recording. Wider means the user is too close.
    pub face_distance_threshold: f32,
    /// Consecutive frames an instruction must persist before it is shown.
    pub hysteresis_frames: u32,
    /// How long the face may stay out of the target region once the oval is shown.
    pub no_fit_timeout: Duration,
    /// Pause between a prepared face and the start of recording.
    pub recording_delay: Duration,
    /// Attempts allowed to open the verification stream, per session.
    pub stream_open_attempts: u32,
    /// Orchestration timer resolution.
    pub tick_interval: Duration,
    /// Target media duration of each video segment.
    pub segment_duration: Duration,
    /// JPEG quality (1-100) for the motion-JPEG segmenter.
    pub jpeg_quality: u8,
    /// Mapping from sensor frames to the upright, user-facing view.
    pub orientation: FrameOrientation,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            merge_iou_threshold: DEFAULT_MERGE_IOU_THRESHOLD,
            face_distance_threshold: 0.32,
            hysteresis_frames: DEFAULT_HYSTERESIS_FRAMES,
            no_fit_timeout: Duration::from_secs(7),
            recording_delay: Duration::from_millis(500),
            stream_open_attempts: 3,
            tick_interval: Duration::from_millis(20),
            segment_duration: Duration::from_secs(1),
            jpeg_quality: 75,
            orientation: FrameOrientation::default(),
        }
    }
}

impl SessionConfig {
    /// Load configuration from `LIVEFACE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let model_path = std::env::var("LIVEFACE_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_path);

        let rotation_degrees = env_u64("LIVEFACE_ROTATION", 0);
        let rotation = Rotation::from_degrees(rotation_degrees as u32).unwrap_or_else(|| {
            tracing::warn!(
                degrees = rotation_degrees,
                "unsupported LIVEFACE_ROTATION, expected 0/90/180/270"
            );
            Rotation::None
        });

        Self {
            model_path,
            confidence_threshold: env_f32(
                "LIVEFACE_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            ),
            merge_iou_threshold: env_f32("LIVEFACE_MERGE_IOU_THRESHOLD", defaults.merge_iou_threshold),
            face_distance_threshold: env_f32(
                "LIVEFACE_FACE_DISTANCE_THRESHOLD",
                defaults.face_distance_threshold,
            ),
            hysteresis_frames: env_usize(
                "LIVEFACE_HYSTERESIS_FRAMES",
                defaults.hysteresis_frames as usize,
            ) as u32,
            no_fit_timeout: Duration::from_millis(env_u64(
                "LIVEFACE_NO_FIT_TIMEOUT_MS",
                duration_ms(defaults.no_fit_timeout),
            )),
            recording_delay: Duration::from_millis(env_u64(
                "LIVEFACE_RECORDING_DELAY_MS",
                duration_ms(defaults.recording_delay),
            )),
            stream_open_attempts: env_usize(
                "LIVEFACE_STREAM_OPEN_ATTEMPTS",
                defaults.stream_open_attempts as usize,
            ) as u32,
            tick_interval: Duration::from_millis(
                env_u64(
                    "LIVEFACE_TICK_INTERVAL_MS",
                    duration_ms(defaults.tick_interval),
                )
                .max(1),
            ),
            segment_duration: Duration::from_millis(env_u64(
                "LIVEFACE_SEGMENT_DURATION_MS",
                duration_ms(defaults.segment_duration),
            )),
            jpeg_quality: env_u64("LIVEFACE_JPEG_QUALITY", defaults.jpeg_quality as u64)
                .clamp(1, 100) as u8,
            orientation: FrameOrientation {
                rotation,
                mirrored: std::env::var("LIVEFACE_MIRRORED")
                    .map(|v| v != "0")
                    .unwrap_or(false),
            },
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            confidence_threshold: self.confidence_threshold,
            merge_iou_threshold: self.merge_iou_threshold,
        }
    }

    pub fn model_path_str(&self) -> String {
        self.model_path.to_string_lossy().into_owned()
    }
}

fn default_model_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("liveface")
        .join("blazeface_short_range.onnx")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
