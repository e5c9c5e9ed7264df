use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array4, ArrayView3, CowArray, Ix3};
use ort::{
    Environment, ExecutionProvider, GraphOptimizationLevel, OrtOwnedTensor, Session, SessionBuilder,
    Value,
};
use tracing::{debug, info};

use crate::{non_max_suppression, BoundingBox, Detection, Detector, DetectorError};

const INPUT_HEIGHT: u32 = 640;
const INPUT_WIDTH: u32 = 640;

/// YOLOv8 plate detector running on ONNX Runtime.
pub struct OnnxPlateDetector {
    session: Arc<Session>,
    labels: Arc<Vec<String>>,
}

impl OnnxPlateDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, labels: Vec<String>) -> Result<Self, DetectorError> {
        info!("Initializing YOLO detector with model: {:?}", model_path.as_ref());

        let environment = Environment::builder()
            .with_name("parking_sentry")
            .with_execution_providers([
                ExecutionProvider::CUDA(Default::default()),
                ExecutionProvider::CPU(Default::default()),
            ])
            .build()
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
            .into_arc();

        let session = SessionBuilder::new(&environment)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?
            .with_model_from_file(model_path)
            .map_err(|e| DetectorError::ModelLoadError(e.to_string()))?;

        Ok(Self {
            session: Arc::new(session),
            labels: Arc::new(labels),
        })
    }
}

#[async_trait]
impl Detector for OnnxPlateDetector {
    async fn detect(
        &self,
        frame: &DynamicImage,
        confidence_threshold: f32,
        iou_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let session = Arc::clone(&self.session);
        let labels = Arc::clone(&self.labels);
        let frame = frame.clone();

        // Inference is CPU/GPU bound, keep it off the async workers.
        tokio::task::spawn_blocking(move || {
            run_inference(&session, &labels, &frame, confidence_threshold, iou_threshold)
        })
        .await
        .map_err(|e| DetectorError::InferenceError(e.to_string()))?
    }
}

fn run_inference(
    session: &Session,
    labels: &[String],
    frame: &DynamicImage,
    confidence_threshold: f32,
    iou_threshold: f32,
) -> Result<Vec<Detection>, DetectorError> {
    let input = CowArray::from(preprocess_image(frame).into_dyn());
    let inputs = vec![Value::from_array(session.allocator(), &input)
        .map_err(|e| DetectorError::ImageProcessError(e.to_string()))?];

    let outputs = session
        .run(inputs)
        .map_err(|e| DetectorError::InferenceError(e.to_string()))?;
    let output: OrtOwnedTensor<f32, _> = outputs[0]
        .try_extract()
        .map_err(|e| DetectorError::InferenceError(e.to_string()))?;
    let view = output.view();
    let predictions = view
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| DetectorError::InferenceError("Unexpected output shape".into()))?;

    let (width, height) = frame.dimensions();
    let candidates = decode_predictions(
        predictions,
        labels,
        confidence_threshold,
        width as f32 / INPUT_WIDTH as f32,
        height as f32 / INPUT_HEIGHT as f32,
    )?;
    let boxes = non_max_suppression(candidates, iou_threshold);

    debug!("Detected {} license plates", boxes.len());
    Ok(boxes)
}

/// Resizes to the network input and lays the pixels out as NCHW in [0, 1].
fn preprocess_image(image: &DynamicImage) -> Array4<f32> {
    let resized = image
        .resize_exact(INPUT_WIDTH, INPUT_HEIGHT, FilterType::Triangle)
        .to_rgb8();

    let mut input = Array4::<f32>::zeros((1, 3, INPUT_HEIGHT as usize, INPUT_WIDTH as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }
    input
}

/// Decodes a YOLOv8 head of shape `[1, 4 + classes, anchors]`.
fn decode_predictions(
    predictions: ArrayView3<f32>,
    labels: &[String],
    confidence_threshold: f32,
    scale_x: f32,
    scale_y: f32,
) -> Result<Vec<Detection>, DetectorError> {
    let attrs = predictions.shape()[1];
    let anchors = predictions.shape()[2];
    if attrs < 5 {
        return Err(DetectorError::InferenceError(
            "Unexpected output shape".into(),
        ));
    }

    let mut detections = Vec::new();
    for a in 0..anchors {
        let (class_id, confidence) = (4..attrs)
            .map(|c| (c - 4, predictions[[0, c, a]]))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if confidence < confidence_threshold {
            continue;
        }

        let x_center = predictions[[0, 0, a]];
        let y_center = predictions[[0, 1, a]];
        let width = predictions[[0, 2, a]];
        let height = predictions[[0, 3, a]];

        detections.push(Detection {
            label: labels
                .get(class_id)
                .cloned()
                .unwrap_or_else(|| format!("class{}", class_id)),
            confidence,
            bbox: BoundingBox::new(
                (x_center - width / 2.0) * scale_x,
                (y_center - height / 2.0) * scale_y,
                (x_center + width / 2.0) * scale_x,
                (y_center + height / 2.0) * scale_y,
            ),
        });
    }

    Ok(detections)
}
