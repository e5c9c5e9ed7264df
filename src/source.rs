//! Camera frame sources.
//!
//! A source is owned by exactly one worker. The production source runs an
//! `ffmpeg` child that decodes the camera URI and writes MJPEG to stdout.

use async_trait::async_trait;
use image::{DynamicImage, ImageFormat};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, info};

use crate::error::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on buffered bytes without a complete frame.
const MAX_PENDING: usize = 16 * 1024 * 1024;

#[async_trait]
pub trait FrameSource: Send {
    /// Next decoded frame. An error means the source needs reacquiring.
    async fn read_frame(&mut self) -> Result<DynamicImage>;

    /// Release the underlying connection and open it again.
    async fn reacquire(&mut self) -> Result<()>;
}

/// Opens a fresh source for a camera. Opening is lazy; the connection is made
/// on the first read.
pub trait SourceFactory: Send + Sync {
    fn open(&self, camera_id: i64, source_uri: &str) -> Box<dyn FrameSource>;
}

/// Splits a concatenated MJPEG byte stream into individual JPEG images.
#[derive(Debug, Default)]
pub struct JpegSplitter {
    pending: Vec<u8>,
}

impl JpegSplitter {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
        if self.pending.len() > MAX_PENDING {
            self.pending.clear();
        }
    }

    /// Pops the next complete `FFD8 .. FFD9` image, discarding any garbage
    /// in front of it.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let start = find_marker(&self.pending, 0, 0xD8)?;
        if start > 0 {
            self.pending.drain(..start);
        }
        let end = find_marker(&self.pending, 2, 0xD9)?;
        Some(self.pending.drain(..end + 2).collect())
    }

    /// Next complete frame that decodes. Corrupt frames are dropped; they do
    /// not mean the stream is broken.
    pub fn next_image(&mut self) -> Option<DynamicImage> {
        while let Some(jpeg) = self.next_frame() {
            match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                Ok(frame) => return Some(frame),
                Err(e) => debug!("Dropping undecodable frame ({} bytes): {}", jpeg.len(), e),
            }
        }
        None
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

fn find_marker(bytes: &[u8], from: usize, marker: u8) -> Option<usize> {
    bytes
        .get(from..)?
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == marker)
        .map(|pos| pos + from)
}

pub struct FfmpegSourceFactory {
    ffmpeg_path: String,
}

impl FfmpegSourceFactory {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl SourceFactory for FfmpegSourceFactory {
    fn open(&self, camera_id: i64, source_uri: &str) -> Box<dyn FrameSource> {
        Box::new(FfmpegSource::new(camera_id, &self.ffmpeg_path, source_uri))
    }
}

pub struct FfmpegSource {
    camera_id: i64,
    ffmpeg_path: String,
    uri: String,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    splitter: JpegSplitter,
    chunk: Vec<u8>,
}

impl FfmpegSource {
    pub fn new(camera_id: i64, ffmpeg_path: &str, uri: &str) -> Self {
        Self {
            camera_id,
            ffmpeg_path: ffmpeg_path.to_string(),
            uri: uri.to_string(),
            child: None,
            stdout: None,
            splitter: JpegSplitter::default(),
            chunk: vec![0; READ_CHUNK],
        }
    }

    fn ffmpeg_args(uri: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["-nostdin".into(), "-loglevel".into(), "error".into()];
        if uri.starts_with("rtsp://") || uri.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".into(), "tcp".into()]);
        } else if !uri.contains("://") {
            // local files play at their native rate
            args.push("-re".into());
        }
        args.extend([
            "-i".into(),
            uri.to_string(),
            "-f".into(),
            "image2pipe".into(),
            "-vcodec".into(),
            "mjpeg".into(),
            "-q:v".into(),
            "5".into(),
            "-".into(),
        ]);
        args
    }

    fn spawn(&mut self) -> Result<()> {
        debug!(camera_id = self.camera_id, "Spawning ffmpeg for {}", self.uri);
        let mut child = Command::new(&self.ffmpeg_path)
            .args(Self::ffmpeg_args(&self.uri))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Capture("ffmpeg stdout unavailable".into()))?;
        self.child = Some(child);
        self.stdout = Some(stdout);
        self.splitter.clear();
        info!(camera_id = self.camera_id, "Connected to {}", self.uri);
        Ok(())
    }

    async fn release(&mut self) {
        self.stdout = None;
        if let Some(mut child) = self.child.take() {
            let _ = child.kill().await;
        }
    }
}

#[async_trait]
impl FrameSource for FfmpegSource {
    async fn read_frame(&mut self) -> Result<DynamicImage> {
        if self.stdout.is_none() {
            self.spawn()?;
        }

        loop {
            if let Some(frame) = self.splitter.next_image() {
                return Ok(frame);
            }

            let stdout = self
                .stdout
                .as_mut()
                .ok_or_else(|| Error::Capture("source not connected".into()))?;
            let n = stdout.read(&mut self.chunk).await?;
            if n == 0 {
                self.release().await;
                return Err(Error::Capture(format!("stream ended: {}", self.uri)));
            }
            self.splitter.push(&self.chunk[..n]);
        }
    }

    async fn reacquire(&mut self) -> Result<()> {
        self.release().await;
        self.spawn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_jpeg(payload: u8) -> Vec<u8> {
        vec![0xFF, 0xD8, payload, payload, 0xFF, 0xD9]
    }

    #[test]
    fn test_splitter_handles_partial_and_garbage() {
        let mut splitter = JpegSplitter::default();
        let mut stream = vec![0x00, 0x01];
        stream.extend(fake_jpeg(7));
        stream.extend(fake_jpeg(9));

        splitter.push(&stream[..5]);
        assert_eq!(splitter.next_frame(), None);
        splitter.push(&stream[5..]);
        assert_eq!(splitter.next_frame(), Some(fake_jpeg(7)));
        assert_eq!(splitter.next_frame(), Some(fake_jpeg(9)));
        assert_eq!(splitter.next_frame(), None);
    }

    #[test]
    fn test_corrupt_frame_is_skipped() {
        let mut real = Vec::new();
        DynamicImage::new_rgb8(12, 8)
            .write_to(&mut std::io::Cursor::new(&mut real), image::ImageOutputFormat::Jpeg(80))
            .unwrap();

        let mut splitter = JpegSplitter::default();
        splitter.push(&fake_jpeg(3));
        splitter.push(&real);

        let frame = splitter.next_image().unwrap();
        assert_eq!((frame.width(), frame.height()), (12, 8));
        assert!(splitter.next_image().is_none());
    }

    #[test]
    fn test_ffmpeg_args_per_source_kind() {
        let rtsp = FfmpegSource::ffmpeg_args("rtsp://127.0.0.1:8554/entrance");
        assert!(rtsp.windows(2).any(|w| w[0] == "-rtsp_transport" && w[1] == "tcp"));
        assert!(!rtsp.contains(&"-re".to_string()));

        let file = FfmpegSource::ffmpeg_args("./videos/entrance.mp4");
        assert!(file.contains(&"-re".to_string()));
        assert_eq!(file.last().map(String::as_str), Some("-"));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_a_read_error() {
        let mut source = FfmpegSource::new(1, "/nonexistent/ffmpeg", "rtsp://127.0.0.1/x");
        assert!(source.read_frame().await.is_err());
        assert!(source.reacquire().await.is_err());
    }
}
