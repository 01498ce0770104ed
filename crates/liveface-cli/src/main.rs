use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use liveface_core::blazeface::BlazeFaceModel;
use liveface_core::challenge::{ChallengeConfig, FreshnessColor, Rgb};
use liveface_core::clock::SystemClock;
use liveface_core::detector::{FaceDetection, FaceDetector};
use liveface_core::frame::Frame;
use liveface_core::geometry::Rect;
use liveface_session::{spawn_session, MjpegSegmenter, PresentationEvent, SessionComponents, SessionConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod loopback;
mod source;

use loopback::LoopbackService;
use source::ImageSequenceSource;

#[derive(Parser)]
#[command(name = "liveface")]
#[command(version, about = "Face liveness pipeline: detection, oval matching, freshness challenge")]
struct Cli {
    /// Override the BlazeFace model path (default: $LIVEFACE_MODEL_PATH or the data dir)
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in a single image and print the classification as JSON
    Detect {
        /// Image file to analyze
        image: PathBuf,
    },
    /// Run a full liveness session against a directory of frames and a loopback service
    Simulate {
        /// Directory of frames, replayed in file-name order
        frames: PathBuf,
        /// Challenge configuration (.toml or .json); a centered default is used otherwise
        #[arg(short, long)]
        challenge: Option<PathBuf>,
        /// Replay rate
        #[arg(long, default_value_t = 30)]
        fps: u32,
        /// Restart the sequence when it runs out
        #[arg(long = "loop")]
        looping: bool,
        /// Write the received video stream here
        #[arg(long)]
        video_out: Option<PathBuf>,
        /// Save the final still frame here
        #[arg(long)]
        still_out: Option<PathBuf>,
        /// Give up after this many seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = SessionConfig::from_env();
    if let Some(model) = cli.model {
        config.model_path = model;
    }

    match cli.command {
        Commands::Detect { image } => detect(&config, &image),
        Commands::Simulate {
            frames,
            challenge,
            fps,
            looping,
            video_out,
            still_out,
            timeout,
        } => {
            let challenge = match challenge {
                Some(path) => load_challenge(&path)?,
                None => default_challenge(),
            };
            simulate(
                &config,
                &frames,
                challenge,
                SimulateOptions {
                    fps,
                    looping,
                    video_out,
                    still_out,
                    timeout: Duration::from_secs(timeout),
                },
            )
            .await
        }
    }
}

fn load_model(config: &SessionConfig) -> Result<BlazeFaceModel> {
    let path = config.model_path_str();
    BlazeFaceModel::load(&path).with_context(|| format!("failed to load model {path}"))
}

fn detect(config: &SessionConfig, image_path: &Path) -> Result<()> {
    let image = image::open(image_path)
        .with_context(|| format!("failed to open {}", image_path.display()))?
        .to_rgb8();
    let frame = config
        .orientation
        .normalize(Frame::new(image, Duration::ZERO));

    let mut detector = FaceDetector::new(
        Box::new(load_model(config)?),
        config.detector_config(),
        Box::new(|_| {}),
    );

    let output = match detector.classify(&frame) {
        FaceDetection::NoFace => serde_json::json!({ "result": "no_face" }),
        FaceDetection::MultipleFaces => serde_json::json!({ "result": "multiple_faces" }),
        FaceDetection::SingleFace(face) => serde_json::json!({
            "result": "single_face",
            "face": face,
            "landmark_box": face.landmark_bounding_box(),
            "distance": face.distance(),
            "prepared": face.distance() <= config.face_distance_threshold,
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

struct SimulateOptions {
    fps: u32,
    looping: bool,
    video_out: Option<PathBuf>,
    still_out: Option<PathBuf>,
    timeout: Duration,
}

async fn simulate(
    config: &SessionConfig,
    frames: &Path,
    challenge: ChallengeConfig,
    options: SimulateOptions,
) -> Result<()> {
    challenge.validate().context("invalid challenge configuration")?;

    let source = ImageSequenceSource::open(frames, options.fps, options.looping)
        .with_context(|| format!("failed to read frames from {}", frames.display()))?;
    if source.is_empty() {
        bail!("no images found in {}", frames.display());
    }

    let service = LoopbackService::new(challenge, options.video_out.clone());
    let report = service.report();

    let mut handle = spawn_session(
        config,
        SessionComponents {
            source: Box::new(source),
            model: Box::new(load_model(config)?),
            encoder: Box::new(MjpegSegmenter::new(
                config.segment_duration,
                config.jpeg_quality,
            )),
            channel: Box::new(service),
            clock: Arc::new(SystemClock),
        },
    )
    .context("failed to start session")?;
    let session_id = handle.id();

    if let Some(mut presentation) = handle.take_presentation() {
        let still_out = options.still_out.clone();
        tokio::spawn(async move {
            while let Some(event) = presentation.recv().await {
                present(event, still_out.as_deref());
            }
        });
    }

    let state = tokio::select! {
        result = handle.wait() => result.context("session ended without a result")?,
        _ = tokio::time::sleep(options.timeout) => bail!("session did not finish within {:?}", options.timeout),
    };

    let report = report
        .lock()
        .map(|r| r.clone())
        .unwrap_or_default();
    let summary = serde_json::json!({
        "session": session_id.to_string(),
        "state": state,
        "service": report,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn present(event: PresentationEvent, still_out: Option<&Path>) {
    match event {
        PresentationEvent::StateChanged(state) => tracing::info!(?state, "state"),
        PresentationEvent::DrawTargetRegion(rect) => tracing::info!(?rect, "draw target region"),
        PresentationEvent::Instruction {
            instruction,
            percentage,
        } => tracing::debug!(?instruction, percentage, "instruction"),
        PresentationEvent::DisplayColor { color, duration } => {
            tracing::info!(rgb = ?color.rgb, scroll = color.scroll, ?duration, "display color")
        }
        PresentationEvent::DisplayStillFrame(image) => {
            let Some(path) = still_out else {
                return;
            };
            match image.save(path) {
                Ok(()) => tracing::info!(path = %path.display(), "still frame saved"),
                Err(e) => tracing::warn!(error = %e, "failed to save still frame"),
            }
        }
    }
}

/// Parse a challenge from TOML, or JSON when the extension says so.
fn load_challenge(path: &Path) -> Result<ChallengeConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let challenge = if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))?
    } else {
        toml::from_str(&text).with_context(|| format!("invalid TOML in {}", path.display()))?
    };
    Ok(challenge)
}

/// Centered target and a short three-color sequence.
pub(crate) fn default_challenge() -> ChallengeConfig {
    ChallengeConfig {
        target_region: Rect::new(0.3, 0.2, 0.4, 0.6),
        iou_threshold: 0.7,
        iou_width_threshold: 0.15,
        iou_height_threshold: 0.15,
        colors: vec![
            FreshnessColor {
                rgb: Rgb::new(255, 255, 255),
                duration_ms: 75,
                scroll: false,
            },
            FreshnessColor {
                rgb: Rgb::new(255, 0, 0),
                duration_ms: 475,
                scroll: true,
            },
            FreshnessColor {
                rgb: Rgb::new(0, 0, 255),
                duration_ms: 475,
                scroll: true,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_challenge_is_valid() {
        assert!(default_challenge().validate().is_ok());
    }

    #[test]
    fn test_load_challenge_toml_and_json() {
        let dir = std::env::temp_dir();
        let toml_path = dir.join(format!("liveface-challenge-{}.toml", std::process::id()));
        std::fs::write(&toml_path, include_str!("../challenge.toml")).unwrap();
        let from_toml = load_challenge(&toml_path).unwrap();
        assert!(from_toml.validate().is_ok());

        let json_path = toml_path.with_extension("json");
        std::fs::write(&json_path, serde_json::to_string(&from_toml).unwrap()).unwrap();
        assert_eq!(load_challenge(&json_path).unwrap(), from_toml);

        std::fs::remove_file(&toml_path).unwrap();
        std::fs::remove_file(&json_path).unwrap();
    }

    #[test]
    fn test_cli_parses_simulate() {
        let cli = Cli::parse_from(["liveface", "simulate", "frames/", "--fps", "15", "--loop"]);
        match cli.command {
            Commands::Simulate { fps, looping, .. } => {
                assert_eq!(fps, 15);
                assert!(looping);
            }
            Commands::Detect { .. } => panic!("expected simulate"),
        }
    }
}
