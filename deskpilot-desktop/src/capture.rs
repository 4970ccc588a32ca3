//! Screen capture ring.

use crate::error::{DesktopError, DesktopResult};
use crate::hyprctl::{self, command_exists, run_output};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use deskpilot_core::CaptureRef;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, ImageEncoder};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Produces one encoded (PNG or similar) frame of the focused output.
#[async_trait]
pub trait ScreenGrabber: Send + Sync {
    async fn grab(&self) -> DesktopResult<Vec<u8>>;
}

/// `grim -o <focused monitor> -`
pub struct GrimGrabber;

#[async_trait]
impl ScreenGrabber for GrimGrabber {
    async fn grab(&self) -> DesktopResult<Vec<u8>> {
        if !command_exists("grim").await {
            return Err(DesktopError::Unavailable(
                "No screenshot backend found (install 'grim')".to_string(),
            ));
        }
        let output = hyprctl::focused_monitor().await?;
        run_output("grim", &["-o", &output, "-"]).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureSettings {
    pub max_width: u32,
    pub max_height: u32,
    pub quality: u8,
    pub capacity: usize,
    pub min_interval: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            max_width: 1280,
            max_height: 720,
            quality: 70,
            capacity: 5,
            min_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub jpeg: Arc<Vec<u8>>,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn capture_ref(&self) -> CaptureRef {
        CaptureRef {
            frame_id: self.id,
            width: self.width,
            height: self.height,
            format: "jpeg".to_string(),
            captured_at: self.captured_at,
        }
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.jpeg.as_slice())
    }
}

/// Largest size fitting `max_w × max_h` with the source aspect ratio.
/// Never upscales.
pub fn fit_within(width: u32, height: u32, max_w: u32, max_h: u32) -> (u32, u32) {
    if width == 0 || height == 0 || (width <= max_w && height <= max_h) {
        return (width, height);
    }
    let scale = f64::min(max_w as f64 / width as f64, max_h as f64 / height as f64);
    let w = ((width as f64 * scale).round() as u32).max(1);
    let h = ((height as f64 * scale).round() as u32).max(1);
    (w, h)
}

/// Decode, downsample (nearest neighbour) and re-encode as JPEG.
pub fn encode_frame(raw: &[u8], max_w: u32, max_h: u32, quality: u8) -> DesktopResult<(u32, u32, Vec<u8>)> {
    let img = image::load_from_memory(raw)?.to_rgb8();
    let (w, h) = fit_within(img.width(), img.height(), max_w, max_h);
    let img = if (w, h) != (img.width(), img.height()) {
        image::imageops::resize(&img, w, h, FilterType::Nearest)
    } else {
        img
    };

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).write_image(
        img.as_raw(),
        w,
        h,
        ExtendedColorType::Rgb8,
    )?;
    Ok((w, h, jpeg))
}

struct RingState {
    frames: VecDeque<Frame>,
    next_id: u64,
    last_capture: Option<Instant>,
}

/// Keeps the last N frames; readers get the newest.
pub struct CaptureRing {
    grabber: Arc<dyn ScreenGrabber>,
    settings: CaptureSettings,
    state: Mutex<RingState>,
}

impl CaptureRing {
    pub fn new(grabber: Arc<dyn ScreenGrabber>, settings: CaptureSettings) -> Self {
        Self {
            grabber,
            settings,
            state: Mutex::new(RingState {
                frames: VecDeque::with_capacity(settings.capacity.max(1)),
                next_id: 1,
                last_capture: None,
            }),
        }
    }

    /// Grab and store a new frame. `Ok(None)` when throttled.
    pub async fn capture(&self) -> DesktopResult<Option<Frame>> {
        {
            let mut state = self.state.lock();
            if let Some(last) = state.last_capture {
                if last.elapsed() < self.settings.min_interval {
                    return Ok(None);
                }
            }
            state.last_capture = Some(Instant::now());
        }

        let raw = self.grabber.grab().await?;
        let settings = self.settings;
        let (width, height, jpeg) = tokio::task::spawn_blocking(move || {
            encode_frame(&raw, settings.max_width, settings.max_height, settings.quality)
        })
        .await
        .map_err(|e| DesktopError::OperationFailed(e.to_string()))??;

        let frame = {
            let mut state = self.state.lock();
            let frame = Frame {
                id: state.next_id,
                width,
                height,
                jpeg: Arc::new(jpeg),
                captured_at: Utc::now(),
            };
            state.next_id += 1;
            if state.frames.len() >= self.settings.capacity.max(1) {
                state.frames.pop_front();
            }
            state.frames.push_back(frame.clone());
            frame
        };
        debug!("Captured frame {} ({}x{})", frame.id, frame.width, frame.height);
        Ok(Some(frame))
    }

    pub fn latest(&self) -> Option<Frame> {
        self.state.lock().frames.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    struct SolidGrabber {
        width: u32,
        height: u32,
    }

    #[async_trait]
    impl ScreenGrabber for SolidGrabber {
        async fn grab(&self) -> DesktopResult<Vec<u8>> {
            let img = RgbImage::from_pixel(self.width, self.height, Rgb([30, 60, 90]));
            let mut png = Cursor::new(Vec::new());
            img.write_to(&mut png, ImageFormat::Png)?;
            Ok(png.into_inner())
        }
    }

    fn settings(capacity: usize) -> CaptureSettings {
        CaptureSettings {
            max_width: 64,
            max_height: 64,
            quality: 60,
            capacity,
            min_interval: Duration::ZERO,
        }
    }

    #[test]
    fn test_fit_preserves_aspect_ratio() {
        assert_eq!(fit_within(1920, 1080, 1280, 720), (1280, 720));
        assert_eq!(fit_within(1000, 2000, 500, 500), (250, 500));
        assert_eq!(fit_within(100, 50, 1280, 720), (100, 50));
        assert_eq!(fit_within(0, 0, 10, 10), (0, 0));
    }

    #[tokio::test]
    async fn test_frames_are_downsampled_jpeg() {
        let ring = CaptureRing::new(
            Arc::new(SolidGrabber {
                width: 256,
                height: 128,
            }),
            settings(5),
        );
        let frame = ring.capture().await.unwrap().unwrap();
        assert_eq!((frame.width, frame.height), (64, 32));
        assert_eq!(&frame.jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(frame.capture_ref().format, "jpeg");
        assert!(!frame.to_base64().is_empty());
    }

    #[tokio::test]
    async fn test_ring_keeps_last_n() {
        let ring = CaptureRing::new(
            Arc::new(SolidGrabber {
                width: 8,
                height: 8,
            }),
            settings(3),
        );
        for _ in 0..5 {
            ring.capture().await.unwrap();
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.latest().unwrap().id, 5);
    }

    #[tokio::test]
    async fn test_throttled_capture_returns_none() {
        let mut settings = settings(3);
        settings.min_interval = Duration::from_secs(60);
        let ring = CaptureRing::new(
            Arc::new(SolidGrabber {
                width: 8,
                height: 8,
            }),
            settings,
        );
        assert!(ring.capture().await.unwrap().is_some());
        assert!(ring.capture().await.unwrap().is_none());
        assert_eq!(ring.len(), 1);
    }
}
