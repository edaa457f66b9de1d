use image::ImageError;
use shared::{NUM_FINDINGS, PredictionResponse, top_finding};

use crate::imaging::heatmap::{self, HeatmapError};
use crate::imaging::preprocess::PreparedImage;
use crate::model::{Classifier, InferenceError};

/// Failure of one stage of a prediction. Every variant is reported to the
/// client the same way, the tag only shows up in logs.
#[derive(Debug, thiserror::Error)]
pub enum PredictError {
    #[error("cannot identify image file: {0}")]
    Decode(#[from] ImageError),
    #[error("inference failed: {0}")]
    Inference(#[source] InferenceError),
    #[error("model returned {got} scores, expected {expected}")]
    UnexpectedOutput { got: usize, expected: usize },
    #[error("saliency generation failed: {0}")]
    Explanation(#[source] InferenceError),
    #[error("heatmap rendering failed: {0}")]
    Encoding(#[from] HeatmapError),
    #[error("prediction worker failed: {0}")]
    Worker(String),
}

/// Decode, classify, and explain the top finding of one uploaded image.
pub fn predict(
    classifier: &dyn Classifier,
    bytes: &[u8],
) -> Result<PredictionResponse, PredictError> {
    let prepared = PreparedImage::decode(bytes)?;

    let scores = classifier.predict(&prepared.input).map_err(PredictError::Inference)?;
    if scores.len() != NUM_FINDINGS {
        return Err(PredictError::UnexpectedOutput {
            got: scores.len(),
            expected: NUM_FINDINGS,
        });
    }
    let (finding, top_score) = top_finding(&scores).ok_or(PredictError::UnexpectedOutput {
        got: 0,
        expected: NUM_FINDINGS,
    })?;

    let cam = classifier
        .explain(&prepared.input, finding as usize)
        .map_err(PredictError::Explanation)?;
    let heatmap_png_base64 = heatmap::render(&prepared.display, &cam)?;

    Ok(PredictionResponse::new(scores, (finding, top_score), heatmap_png_base64))
}
