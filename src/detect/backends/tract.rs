#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::Detector;
use crate::detect::result::Detection;
use crate::error::DetectorError;
use crate::frame::{Frame, FrameEncoding};
use crate::geometry::BBox;

/// Tract-based backend for YOLO-style ONNX detection models.
///
/// Expects a single output of shape `[1, 4 + classes, anchors]` where the
/// first four rows are `cx, cy, w, h` in model input pixels and the rest are
/// per-class scores. Boxes are scaled back to frame pixels.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    width: u32,
    height: u32,
    labels: Vec<String>,
    score_threshold: f32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        width: u32,
        height: u32,
        labels: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        if labels.is_empty() {
            return Err(anyhow!("tract backend needs at least one class label"));
        }
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, height as usize, width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            width,
            height,
            labels,
            score_threshold: 0.25,
        })
    }

    /// Minimum class score for a raw anchor to be reported at all.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    fn decode(&self, frame: &Frame) -> Result<RgbImage, DetectorError> {
        match frame.encoding() {
            FrameEncoding::Rgb8 => {
                RgbImage::from_raw(frame.width(), frame.height(), frame.payload().to_vec())
                    .ok_or_else(|| DetectorError::InvalidInput("rgb payload size mismatch".into()))
            }
            FrameEncoding::Jpeg | FrameEncoding::Png => image::load_from_memory(frame.payload())
                .map(|img| img.to_rgb8())
                .map_err(|e| DetectorError::InvalidInput(format!("image decode failed: {}", e))),
        }
    }

    fn build_input(&self, image: &RgbImage) -> Tensor {
        let resized = image::imageops::resize(image, self.width, self.height, FilterType::Triangle);
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.height as usize, self.width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    fn extract_detections(
        &self,
        outputs: TVec<TValue>,
        frame_w: u32,
        frame_h: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let output = outputs
            .first()
            .ok_or_else(|| DetectorError::Unavailable("model produced no outputs".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectorError::Unavailable(format!("output tensor was not f32: {}", e)))?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| DetectorError::Unavailable(format!("unexpected output rank: {}", e)))?;

        let rows = view.shape()[1];
        let anchors = view.shape()[2];
        if rows < 4 + self.labels.len() {
            return Err(DetectorError::Unavailable(format!(
                "model output has {} rows, need {} for {} labels",
                rows,
                4 + self.labels.len(),
                self.labels.len()
            )));
        }

        let sx = frame_w as f32 / self.width as f32;
        let sy = frame_h as f32 / self.height as f32;
        let mut out = Vec::new();
        for i in 0..anchors {
            let (class_idx, score) = (0..self.labels.len())
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 {
                        cur
                    } else {
                        best
                    }
                });
            if !score.is_finite() || score < self.score_threshold {
                continue;
            }
            let (cx, cy, w, h) = (
                view[[0, 0, i]],
                view[[0, 1, i]],
                view[[0, 2, i]],
                view[[0, 3, i]],
            );
            let bbox = BBox::new(
                (cx - w / 2.0) * sx,
                (cy - h / 2.0) * sy,
                (cx + w / 2.0) * sx,
                (cy + h / 2.0) * sy,
            );
            out.push(Detection::new(
                self.labels[class_idx].clone(),
                score.min(1.0),
                bbox,
            ));
        }
        Ok(out)
    }
}

impl Detector for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, DetectorError> {
        let image = self.decode(frame)?;
        let input = self.build_input(&image);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectorError::Unavailable(format!("ONNX inference failed: {}", e)))?;
        self.extract_detections(outputs, image.width(), image.height())
    }
}
