//! Latest-frame fan-out for live streaming.
//!
//! Each worker owns one [`FrameBuffer`]: a single slot that the worker
//! overwrites every iteration. Consumers pull from it through a
//! [`FrameSubscriber`], which paces itself and substitutes a placeholder
//! until the first real frame exists. Frames are immutable `Arc<[u8]>`, so a
//! reader only holds the lock long enough to clone the pointer.
//!
//! Subscribers created by the [`FrameBroadcaster`] look the camera up again
//! before every frame. A replacement worker's buffer is picked up as soon as
//! it exists, and the stream ends once the camera is stopped.

use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::config::StreamingSettings;
use crate::error::Result;
use crate::registry::CameraRegistry;

/// Multipart boundary used by the streaming endpoint.
pub const BOUNDARY: &str = "frame";

pub type Frame = Arc<[u8]>;

#[derive(Debug, Default)]
pub struct FrameBuffer {
    slot: RwLock<Option<Frame>>,
}

impl FrameBuffer {
    pub fn publish(&self, jpeg: Vec<u8>) {
        let frame: Frame = jpeg.into();
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }

    pub fn latest(&self) -> Option<Frame> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Clone)]
pub enum StreamFrame {
    Live(Frame),
    Placeholder(Frame),
}

impl StreamFrame {
    pub fn bytes(&self) -> &[u8] {
        match self {
            StreamFrame::Live(frame) | StreamFrame::Placeholder(frame) => &frame[..],
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, StreamFrame::Placeholder(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamPacing {
    pub frame_interval: Duration,
    pub placeholder_interval: Duration,
}

impl From<&StreamingSettings> for StreamPacing {
    fn from(settings: &StreamingSettings) -> Self {
        Self {
            frame_interval: Duration::from_millis(settings.frame_interval_ms),
            placeholder_interval: Duration::from_millis(settings.placeholder_interval_ms),
        }
    }
}

struct CameraLink {
    registry: Arc<CameraRegistry>,
    camera_id: i64,
    source_uri: String,
}

/// One streaming consumer's cursor over a worker's buffer.
pub struct FrameSubscriber {
    buffer: Arc<FrameBuffer>,
    camera: Option<CameraLink>,
    placeholder: Frame,
    pacing: StreamPacing,
    pending_delay: Option<Duration>,
}

impl FrameSubscriber {
    /// Subscriber pinned to one buffer; it never ends.
    pub fn new(buffer: Arc<FrameBuffer>, placeholder: Frame, pacing: StreamPacing) -> Self {
        Self {
            buffer,
            camera: None,
            placeholder,
            pacing,
            pending_delay: None,
        }
    }

    /// Waits out the pace of the previous frame, then returns the newest
    /// frame, or the placeholder when nothing has been published yet.
    /// `None` means the camera was stopped and the stream is over.
    pub async fn next_frame(&mut self) -> Option<StreamFrame> {
        if let Some(delay) = self.pending_delay.take() {
            tokio::time::sleep(delay).await;
        }

        if let Some(link) = &self.camera {
            let feed = link.registry.resume_feed(link.camera_id, &link.source_uri)?;
            self.buffer = feed.frames();
        }

        let frame = match self.buffer.latest() {
            Some(frame) => {
                self.pending_delay = Some(self.pacing.frame_interval);
                StreamFrame::Live(frame)
            }
            None => {
                self.pending_delay = Some(self.pacing.placeholder_interval);
                StreamFrame::Placeholder(Arc::clone(&self.placeholder))
            }
        };
        Some(frame)
    }
}

pub struct FrameBroadcaster {
    registry: Arc<CameraRegistry>,
    placeholder: Frame,
    pacing: StreamPacing,
}

impl FrameBroadcaster {
    pub fn new(registry: Arc<CameraRegistry>, placeholder: Vec<u8>, pacing: StreamPacing) -> Self {
        Self {
            registry,
            placeholder: placeholder.into(),
            pacing,
        }
    }

    /// Attaches a consumer to the camera, starting its worker if needed.
    pub fn subscribe(&self, camera_id: i64, source_uri: &str) -> FrameSubscriber {
        let feed = self.registry.ensure_running(camera_id, source_uri);
        let mut subscriber =
            FrameSubscriber::new(feed.frames(), Arc::clone(&self.placeholder), self.pacing);
        subscriber.camera = Some(CameraLink {
            registry: Arc::clone(&self.registry),
            camera_id,
            source_uri: source_uri.to_string(),
        });
        subscriber
    }
}

pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, quality).encode_image(frame)?;
    Ok(bytes)
}

/// Dark frame with a light bar, served while a camera is still connecting.
pub fn placeholder_jpeg(width: u32, height: u32) -> Result<Vec<u8>> {
    let width = width.max(16);
    let height = height.max(16);
    let mut frame = RgbImage::from_pixel(width, height, Rgb([32, 32, 32]));
    let bar = Rect::at((width / 4) as i32, (height / 2 - height / 16) as i32)
        .of_size(width / 2, (height / 8).max(1));
    draw_filled_rect_mut(&mut frame, bar, Rgb([96, 96, 96]));
    encode_jpeg(&frame, 70)
}

/// Wraps one JPEG as a `multipart/x-mixed-replace` part.
pub fn multipart_part(jpeg: &[u8]) -> Vec<u8> {
    let header = format!(
        "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        BOUNDARY,
        jpeg.len()
    );
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 2);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    part
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacing() -> StreamPacing {
        StreamPacing {
            frame_interval: Duration::from_millis(40),
            placeholder_interval: Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_buffer_overwrites_single_slot() {
        let buffer = FrameBuffer::default();
        assert!(buffer.latest().is_none());
        buffer.publish(vec![1, 2, 3]);
        buffer.publish(vec![4, 5]);
        assert_eq!(buffer.latest().as_deref(), Some(&[4u8, 5][..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_until_first_frame() {
        let buffer = Arc::new(FrameBuffer::default());
        let mut subscriber =
            FrameSubscriber::new(Arc::clone(&buffer), Arc::from(vec![0u8; 4]), pacing());

        let first = subscriber.next_frame().await.unwrap();
        assert!(first.is_placeholder());

        let started = tokio::time::Instant::now();
        let second = subscriber.next_frame().await.unwrap();
        assert!(second.is_placeholder());
        assert!(started.elapsed() >= Duration::from_millis(1000));

        buffer.publish(vec![9, 9, 9]);
        let live = subscriber.next_frame().await.unwrap();
        assert!(!live.is_placeholder());
        assert_eq!(live.bytes(), &[9, 9, 9]);

        let started = tokio::time::Instant::now();
        subscriber.next_frame().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(40) && waited < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_frames() {
        let buffer = Arc::new(FrameBuffer::default());
        let writer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                for i in 0..200u8 {
                    buffer.publish(vec![i; 1024]);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let buffer = Arc::clone(&buffer);
            readers.push(tokio::spawn(async move {
                for _ in 0..200 {
                    if let Some(frame) = buffer.latest() {
                        assert_eq!(frame.len(), 1024);
                        assert!(frame.iter().all(|b| *b == frame[0]));
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[test]
    fn test_placeholder_is_a_jpeg() {
        let jpeg = placeholder_jpeg(64, 36).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 36));
    }

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[1, 2, 3]);
        let text = String::from_utf8_lossy(&part);
        assert!(text
            .starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 3\r\n\r\n"));
        assert!(part.ends_with(&[1, 2, 3, b'\r', b'\n']));
    }
}
