use async_trait::async_trait;
use image::{DynamicImage, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use thiserror::Error;
use tracing::warn;

#[cfg(feature = "onnx")]
mod onnx;

#[cfg(feature = "onnx")]
pub use onnx::OnnxPlateDetector;

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Failed to load YOLO model: {0}")]
    ModelLoadError(String),
    #[error("Failed to process image: {0}")]
    ImageProcessError(String),
    #[error("Inference error: {0}")]
    InferenceError(String),
    #[error("Detector unavailable")]
    Unavailable,
}

/// Axis-aligned box in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoundingBox {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Integer crop window, already clamped to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x_min: f32, y_min: f32, x_max: f32, y_max: f32) -> Self {
        Self {
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }

    pub fn width(&self) -> f32 {
        (self.x_max - self.x_min).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y_max - self.y_min).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x_left = self.x_min.max(other.x_min);
        let y_top = self.y_min.max(other.y_min);
        let x_right = self.x_max.min(other.x_max);
        let y_bottom = self.y_max.min(other.y_max);

        if x_right < x_left || y_bottom < y_top {
            return 0.0;
        }

        let intersection_area = (x_right - x_left) * (y_bottom - y_top);
        let union = self.area() + other.area() - intersection_area;
        if union <= 0.0 {
            return 0.0;
        }
        intersection_area / union
    }

    /// Grows the box by `pad` pixels on every side and clamps it to a
    /// `frame_width` x `frame_height` frame. Returns `None` when nothing of
    /// the box is left inside the frame.
    pub fn padded_region(
        &self,
        pad: u32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<CropRegion> {
        let pad = pad as f32;
        let x1 = (self.x_min - pad).max(0.0).floor() as u32;
        let y1 = (self.y_min - pad).max(0.0).floor() as u32;
        let x2 = ((self.x_max + pad).max(0.0).ceil() as u32).min(frame_width);
        let y2 = ((self.y_max + pad).max(0.0).ceil() as u32).min(frame_height);

        if x2 <= x1 || y2 <= y1 {
            return None;
        }

        Some(CropRegion {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Detection {
    /// Class name reported by the model, e.g. `blue` or `green`.
    pub label: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
}

/// A plate detector. Implementations may be slow; callers treat an error as
/// "no detections this frame".
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(
        &self,
        frame: &DynamicImage,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Stand-in used when no model could be loaded. Never detects anything, so the
/// pipeline keeps capturing and streaming.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledDetector;

#[async_trait]
impl Detector for DisabledDetector {
    async fn detect(
        &self,
        _frame: &DynamicImage,
        _confidence_threshold: f32,
        _iou_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        Ok(Vec::new())
    }
}

/// Runs `detector` and folds any failure into an empty result.
pub async fn detect_or_empty(
    detector: &dyn Detector,
    frame: &DynamicImage,
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Vec<Detection> {
    match detector
        .detect(frame, confidence_threshold, iou_threshold)
        .await
    {
        Ok(detections) => detections,
        Err(e) => {
            warn!("Detection failed, treating frame as empty: {}", e);
            Vec::new()
        }
    }
}

/// Greedy class-agnostic NMS. Output is ordered by descending confidence.
pub fn non_max_suppression(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut keep = vec![true; detections.len()];

    for i in 0..detections.len() {
        if !keep[i] {
            continue;
        }

        for j in (i + 1)..detections.len() {
            if !keep[j] {
                continue;
            }

            if detections[i].bbox.iou(&detections[j].bbox) > iou_threshold {
                keep[j] = false;
            }
        }
    }

    detections
        .into_iter()
        .zip(keep)
        .filter_map(|(det, keep)| if keep { Some(det) } else { None })
        .collect()
}

/// Outlines every detection on `frame`.
pub fn draw_detections(frame: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = frame.dimensions();
    for det in detections {
        let Some(region) = det.bbox.padded_region(0, width, height) else {
            continue;
        };
        let rect = Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height);
        draw_hollow_rect_mut(frame, rect, Rgb([0, 255, 0]));
        if region.width > 2 && region.height > 2 {
            let inner = Rect::at(region.x as i32 + 1, region.y as i32 + 1)
                .of_size(region.width - 2, region.height - 2);
            draw_hollow_rect_mut(frame, inner, Rgb([0, 255, 0]));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(label: &str, confidence: f32, bbox: BoundingBox) -> Detection {
        Detection {
            label: label.into(),
            confidence,
            bbox,
        }
    }

    #[test]
    fn test_iou_of_identical_and_disjoint_boxes() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert!((a.iou(&a) - 1.0).abs() < f32::EPSILON);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_nms_drops_overlapping_lower_confidence() {
        let boxes = vec![
            det("blue", 0.6, BoundingBox::new(0.0, 0.0, 10.0, 10.0)),
            det("blue", 0.9, BoundingBox::new(1.0, 1.0, 11.0, 11.0)),
            det("green", 0.7, BoundingBox::new(50.0, 50.0, 60.0, 60.0)),
        ];
        let kept = non_max_suppression(boxes, 0.45);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].label, "green");
    }

    #[test]
    fn test_padded_region_clamps_to_frame() {
        let bbox = BoundingBox::new(2.0, 3.0, 98.0, 40.0);
        let region = bbox.padded_region(5, 100, 42).unwrap();
        assert_eq!(
            region,
            CropRegion {
                x: 0,
                y: 0,
                width: 100,
                height: 42
            }
        );
    }

    #[test]
    fn test_padded_region_outside_frame_is_none() {
        let bbox = BoundingBox::new(200.0, 200.0, 220.0, 210.0);
        assert!(bbox.padded_region(5, 100, 100).is_none());
    }

    #[test]
    fn test_draw_detections_marks_box_edges() {
        let mut frame = RgbImage::new(20, 20);
        draw_detections(
            &mut frame,
            &[det("blue", 0.8, BoundingBox::new(2.0, 2.0, 10.0, 10.0))],
        );
        assert_eq!(frame.get_pixel(2, 2), &Rgb([0, 255, 0]));
        assert_eq!(frame.get_pixel(15, 15), &Rgb([0, 0, 0]));
    }

    #[tokio::test]
    async fn test_disabled_detector_finds_nothing() {
        let frame = DynamicImage::new_rgb8(8, 8);
        let found = detect_or_empty(&DisabledDetector, &frame, 0.5, 0.45).await;
        assert!(found.is_empty());
    }

    struct CrashingDetector;

    #[async_trait]
    impl Detector for CrashingDetector {
        async fn detect(
            &self,
            _frame: &DynamicImage,
            _confidence_threshold: f32,
            _iou_threshold: f32,
        ) -> Result<Vec<Detection>, DetectorError> {
            Err(DetectorError::InferenceError("out of memory".into()))
        }
    }

    #[tokio::test]
    async fn test_detector_error_yields_no_detections() {
        let frame = DynamicImage::new_rgb8(8, 8);
        let found = detect_or_empty(&CrashingDetector, &frame, 0.5, 0.45).await;
        assert!(found.is_empty());
    }

    #[test]
    fn test_detection_serializes_label() {
        let detection = det("yellow", 0.5, BoundingBox::new(0.0, 0.0, 1.0, 1.0));
        let json = serde_json::to_value(detection).unwrap();
        assert_eq!(json["label"], "yellow");
    }
}
