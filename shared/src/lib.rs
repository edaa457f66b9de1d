use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{AsRefStr, Display, EnumCount, EnumIter, EnumString};

/// NIH ChestX-ray14 findings in model output order.
///
/// The declaration order is the order of the classifier's output units and of
/// every `labels`/`scores` array on the wire, so variants must never be
/// reordered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
    EnumCount,
    EnumString,
)]
pub enum Finding {
    Atelectasis,
    Cardiomegaly,
    Effusion,
    Infiltration,
    Mass,
    Nodule,
    Pneumonia,
    Pneumothorax,
    Consolidation,
    Edema,
    Emphysema,
    Fibrosis,
    #[serde(rename = "Pleural_Thickening")]
    #[strum(serialize = "Pleural_Thickening")]
    PleuralThickening,
    Hernia,
}

impl Finding {
    pub fn from_index(index: usize) -> Option<Finding> {
        Finding::iter().nth(index)
    }

    pub fn labels() -> Vec<String> {
        Finding::iter().map(|finding| finding.to_string()).collect()
    }
}

/// Number of output units of the classifier head.
pub const NUM_FINDINGS: usize = <Finding as strum::EnumCount>::COUNT;

/// Picks the highest score. Ties resolve to the lowest index and NaN scores
/// never win.
pub fn top_finding(scores: &[f32]) -> Option<(Finding, f32)> {
    let mut best: Option<(usize, f32)> = None;
    for (index, &score) in scores.iter().enumerate().take(NUM_FINDINGS) {
        match best {
            Some((_, best_score)) if score <= best_score || score.is_nan() => {}
            None if score.is_nan() => {}
            _ => best = Some((index, score)),
        }
    }
    best.and_then(|(index, score)| Finding::from_index(index).map(|finding| (finding, score)))
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PredictionResponse {
    pub labels: Vec<String>,
    pub scores: Vec<f32>,
    pub top_label: String,
    pub top_score: f32,
    pub heatmap_png_base64: String,
}

impl PredictionResponse {
    pub fn new(scores: Vec<f32>, top: (Finding, f32), heatmap_png_base64: String) -> Self {
        let (finding, top_score) = top;
        Self {
            labels: Finding::labels(),
            scores,
            top_label: finding.to_string(),
            top_score,
            heatmap_png_base64,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub model: String,
    pub labels: usize,
}

impl HealthResponse {
    pub fn healthy(model: &str) -> Self {
        Self {
            status: "healthy".into(),
            model: model.into(),
            labels: NUM_FINDINGS,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    pub detail: String,
}
