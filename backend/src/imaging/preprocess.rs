use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageError, RgbImage};
use ndarray::{Array3, Array4};

/// Side length of the square model input.
pub const INPUT_SIZE: u32 = 224;

/// ImageNet channel statistics the backbone was trained with.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// The two views of an uploaded image: the normalized `1x3xHxW` model input
/// and the `HxWx3` 0-1 raster the heatmap is drawn over.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub input: Array4<f32>,
    pub display: Array3<f32>,
}

impl PreparedImage {
    pub fn decode(bytes: &[u8]) -> Result<Self, ImageError> {
        let image = image::load_from_memory(bytes)?;
        Ok(Self::from_image(&image))
    }

    pub fn from_image(image: &DynamicImage) -> Self {
        let rgb = resize_to_input(image.to_rgb8());
        let (width, height) = rgb.dimensions();

        let display = Array3::from_shape_fn((height as usize, width as usize, 3), |(y, x, c)| {
            f32::from(rgb.get_pixel(x as u32, y as u32)[c]) / 255.0
        });
        let input = Array4::from_shape_fn((1, 3, height as usize, width as usize), |(_, c, y, x)| {
            (display[[y, x, c]] - MEAN[c]) / STD[c]
        });

        Self { input, display }
    }
}

fn resize_to_input(rgb: RgbImage) -> RgbImage {
    if rgb.dimensions() == (INPUT_SIZE, INPUT_SIZE) {
        return rgb;
    }
    imageops::resize(&rgb, INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom)
}
