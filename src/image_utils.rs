use image::{DynamicImage, GrayImage, Luma, RgbImage};
use ndarray::{Array2, s};
use rayon::prelude::*;

use crate::error::{ForensicsError, Result};

pub fn rgb_to_gray(image: &RgbImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut gray = GrayImage::new(width, height);

    for (x, y, pixel) in image.enumerate_pixels() {
        let lum = 0.299 * pixel[0] as f64 + 0.587 * pixel[1] as f64 + 0.114 * pixel[2] as f64;
        gray.put_pixel(x, y, Luma([lum.round().clamp(0.0, 255.0) as u8]));
    }

    gray
}

/// Converts a decoded image to grayscale, rejecting images with no pixels.
pub fn to_gray(image: &DynamicImage) -> Result<GrayImage> {
    let (width, height) = (image.width(), image.height());
    if width == 0 || height == 0 {
        return Err(ForensicsError::InvalidImage(format!(
            "image has no pixels ({}x{})",
            width, height
        )));
    }

    let gray = match image {
        DynamicImage::ImageLuma8(gray) => gray.clone(),
        other => rgb_to_gray(&other.to_rgb8()),
    };

    Ok(gray)
}

/// Row-major `(height, width)` array with intensities scaled to `[0, 1]`.
pub fn gray_to_array(image: &GrayImage) -> Array2<f32> {
    let (width, height) = image.dimensions();
    let mut arr = Array2::zeros((height as usize, width as usize));

    for (x, y, pixel) in image.enumerate_pixels() {
        arr[[y as usize, x as usize]] = pixel[0] as f32 / 255.0;
    }

    arr
}

/// Bilinear 2x enlargement with pixel-centre alignment.
pub fn upsample_2x(arr: &Array2<f32>) -> Array2<f32> {
    let (height, width) = arr.dim();
    let (out_h, out_w) = (height * 2, width * 2);

    let sample = |dst: usize, len: usize| -> (usize, usize, f32) {
        let src = ((dst as f32 + 0.5) * 0.5 - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(len - 1);
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, src - i0 as f32)
    };

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = sample(y, height);
        let (x0, x1, fx) = sample(x, width);
        let top = arr[[y0, x0]] * (1.0 - fx) + arr[[y0, x1]] * fx;
        let bottom = arr[[y1, x0]] * (1.0 - fx) + arr[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Keeps every second pixel in both directions.
pub fn downsample_2x(arr: &Array2<f32>) -> Array2<f32> {
    let (height, width) = arr.dim();
    let (out_h, out_w) = (height / 2, width / 2);
    arr.slice(s![..out_h * 2;2, ..out_w * 2;2]).to_owned()
}

pub fn gaussian_kernel(sigma: f32) -> Vec<f32> {
    let size = ((sigma * 8.0 + 1.0).round() as usize) | 1;
    let half = (size / 2) as isize;
    let denom = 2.0 * sigma * sigma;

    let mut kernel = (-half..=half)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect::<Vec<_>>();
    let sum = kernel.iter().sum::<f32>();
    kernel.iter_mut().for_each(|v| *v /= sum);

    kernel
}

/// Mirror index across the border without repeating the edge pixel.
fn reflect_101(i: isize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let last = len as isize - 1;
    let mut i = i;
    loop {
        if i < 0 {
            i = -i;
        } else if i > last {
            i = 2 * last - i;
        } else {
            return i as usize;
        }
    }
}

/// Separable Gaussian blur; rows are processed in parallel.
pub fn gaussian_blur(arr: &Array2<f32>, sigma: f32) -> Array2<f32> {
    let (height, width) = arr.dim();
    if height == 0 || width == 0 {
        return arr.clone();
    }

    let kernel = gaussian_kernel(sigma);
    let half = (kernel.len() / 2) as isize;
    let src = arr.as_standard_layout();
    let src = src.as_slice().unwrap_or_default();

    let mut horizontal = vec![0.0f32; height * width];
    horizontal
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let line = &src[y * width..(y + 1) * width];
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| w * line[reflect_101(x as isize + k as isize - half, width)])
                    .sum();
            }
        });

    let mut vertical = vec![0.0f32; height * width];
    vertical
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                *out = kernel
                    .iter()
                    .enumerate()
                    .map(|(k, w)| {
                        let sy = reflect_101(y as isize + k as isize - half, height);
                        w * horizontal[sy * width + x]
                    })
                    .sum();
            }
        });

    Array2::from_shape_vec((height, width), vertical).unwrap_or_else(|_| arr.clone())
}
