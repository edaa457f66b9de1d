use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::{Array2, Array4};
use shared::{Finding, NUM_FINDINGS};
use std::io::Cursor;
use std::sync::Mutex;

use crate::model::{Classifier, InferenceError};

/// Classifier with canned scores that records which classes it explained.
pub struct StubClassifier {
    scores: Vec<f32>,
    fail_explain: bool,
    explained: Mutex<Vec<usize>>,
}

impl StubClassifier {
    pub fn with_scores(scores: Vec<f32>) -> Self {
        Self {
            scores,
            fail_explain: false,
            explained: Mutex::new(Vec::new()),
        }
    }

    pub fn with_top(finding: Finding, score: f32) -> Self {
        let mut scores: Vec<f32> = (0..NUM_FINDINGS).map(|i| 0.01 * i as f32).collect();
        scores[finding as usize] = score;
        Self::with_scores(scores)
    }

    pub fn failing_explain(mut self) -> Self {
        self.fail_explain = true;
        self
    }

    pub fn explained(&self) -> Vec<usize> {
        self.explained.lock().unwrap().clone()
    }
}

impl Classifier for StubClassifier {
    fn name(&self) -> &str {
        "DenseNet-121"
    }

    fn predict(&self, _input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        Ok(self.scores.clone())
    }

    fn explain(
        &self,
        input: &Array4<f32>,
        class_index: usize,
    ) -> Result<Array2<f32>, InferenceError> {
        if self.fail_explain {
            return Err(InferenceError::SaliencyShape(vec![0]));
        }
        self.explained.lock().unwrap().push(class_index);
        // Coarse map derived from the input so identical uploads render identically.
        Ok(Array2::from_shape_fn((7, 7), |(y, x)| {
            input[[0, 0, y * 32, x * 32]].abs() + (x + y) as f32
        }))
    }
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}
