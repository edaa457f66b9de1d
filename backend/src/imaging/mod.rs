pub mod heatmap;
pub mod preprocess;
