use base64::{Engine, engine::general_purpose::STANDARD};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, ImageError, ImageFormat, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3};
use std::io::Cursor;

/// Weight of the original image in the blended overlay.
const IMAGE_WEIGHT: f32 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum HeatmapError {
    #[error("Empty saliency map")]
    EmptyMap,
    #[error("Display image has unexpected shape {0:?}")]
    DisplayShape(Vec<usize>),
    #[error("PNG encoding failed: {0}")]
    Encoding(#[from] ImageError),
}

/// Shifts the map to start at zero and scales its maximum to one.
pub fn normalize(cam: &Array2<f32>) -> Array2<f32> {
    let min = cam.iter().copied().fold(f32::INFINITY, f32::min);
    let shifted = cam.mapv(|v| v - min);
    let max = shifted.iter().copied().fold(0.0, f32::max);
    shifted.mapv(|v| v / (max + 1e-7))
}

/// Bilinear resize of a 0-1 map to `width x height`.
pub fn resize_map(
    map: &Array2<f32>,
    width: u32,
    height: u32,
) -> Result<Array2<f32>, HeatmapError> {
    let (rows, cols) = map.dim();
    if rows == 0 || cols == 0 {
        return Err(HeatmapError::EmptyMap);
    }
    if (cols as u32, rows as u32) == (width, height) {
        return Ok(map.clone());
    }
    let source: ImageBuffer<Luma<f32>, Vec<f32>> =
        ImageBuffer::from_fn(cols as u32, rows as u32, |x, y| {
            Luma([map[[y as usize, x as usize]]])
        });
    let resized = imageops::resize(&source, width, height, FilterType::Triangle);
    Ok(Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
        resized.get_pixel(x as u32, y as u32)[0]
    }))
}

/// Jet colormap: dark blue at 0, through cyan, yellow, to dark red at 1.
pub fn jet(value: f32) -> [f32; 3] {
    let v = value.clamp(0.0, 1.0);
    let channel = |offset: f32| (1.5 - (4.0 * v - offset).abs()).clamp(0.0, 1.0);
    [channel(3.0), channel(2.0), channel(1.0)]
}

/// Display-sized 0-1 mask for a raw class-activation map. Normalized again
/// after upsampling so the peak reaches the top of the colormap.
pub fn saliency_mask(
    cam: &Array2<f32>,
    width: u32,
    height: u32,
) -> Result<Array2<f32>, HeatmapError> {
    Ok(normalize(&resize_map(&normalize(cam), width, height)?))
}

/// Blends the jet-colored mask over the display raster and rescales the
/// result so its brightest channel value maps to 255.
pub fn overlay(display: &Array3<f32>, mask: &Array2<f32>) -> Result<RgbImage, HeatmapError> {
    let (height, width, channels) = display.dim();
    if channels != 3 || mask.dim() != (height, width) {
        return Err(HeatmapError::DisplayShape(display.shape().to_vec()));
    }

    let blended = Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        // Quantized like an 8-bit colormap lookup.
        let level = f32::from((255.0 * mask[[y, x]].clamp(0.0, 1.0)) as u8) / 255.0;
        (1.0 - IMAGE_WEIGHT) * jet(level)[c] + IMAGE_WEIGHT * display[[y, x, c]]
    });
    let max = blended.iter().copied().fold(0.0, f32::max);
    let scale = if max > 0.0 { 1.0 / max } else { 0.0 };

    Ok(RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb(std::array::from_fn(|c| (255.0 * blended[[y, x, c]] * scale) as u8))
    }))
}

pub fn encode_png_base64(image: &RgbImage) -> Result<String, HeatmapError> {
    let mut png = Vec::new();
    image.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(STANDARD.encode(png))
}

/// Turns a raw class-activation map into the base64 PNG overlay returned to
/// clients.
pub fn render(display: &Array3<f32>, cam: &Array2<f32>) -> Result<String, HeatmapError> {
    let (height, width, _) = display.dim();
    let mask = saliency_mask(cam, width as u32, height as u32)?;
    let image = overlay(display, &mask)?;
    encode_png_base64(&image)
}
