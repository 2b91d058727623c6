use anyhow::Result;
use image::{imageops::FilterType, RgbImage};
use ndarray::Array4;

/// ViT-style preprocessing for the captioning encoder.
/// Based on the processor config: 224x224 resize, rescale by 1/255, then
/// normalize with mean 0.5 and std 0.5.
pub struct CaptionImageProcessor {
    size: (u32, u32),
    image_mean: [f32; 3],
    image_std: [f32; 3],
    rescale_factor: f32,
}

impl CaptionImageProcessor {
    pub fn new() -> Self {
        Self {
            size: (224, 224),
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
            // 1/255
            rescale_factor: 0.00392156862745098,
        }
    }

    /// Output shape: [1, 3, 224, 224] (batch, channels, height, width)
    pub fn preprocess(&self, image: &RgbImage) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(anyhow::anyhow!("Cannot preprocess an empty image"));
        }
        let resized = image::imageops::resize(image, self.size.0, self.size.1, FilterType::Triangle);
        Ok(self.to_tensor(&resized))
    }

    fn to_tensor(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = image.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                let normalized_value =
                    (pixel[c] as f32 * self.rescale_factor - self.image_mean[c]) / self.image_std[c];
                tensor[[0, c, y as usize, x as usize]] = normalized_value;
            }
        }

        tensor
    }
}

impl Default for CaptionImageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_shape_and_range() {
        let img = RgbImage::from_pixel(100, 40, image::Rgb([255, 0, 128]));
        let tensor = CaptionImageProcessor::new().preprocess(&img).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        assert!((tensor[[0, 0, 10, 10]] - 1.0).abs() < 0.01);
        assert!((tensor[[0, 1, 10, 10]] + 1.0).abs() < 0.01);
        assert!(tensor[[0, 2, 10, 10]].abs() < 0.01);
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let img = RgbImage::new(0, 0);
        assert!(CaptionImageProcessor::new().preprocess(&img).is_err());
    }
}
