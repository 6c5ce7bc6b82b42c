//! Image preprocessing for the CLIP image encoder.
//!
//! Images are resized so the long side is `224 + 2 * 224` pixels, padded to a
//! black square, and the central 224x224 window is kept. Pixel values are
//! then normalised per channel and laid out as NCHW.

use image::{ColorType, DynamicImage, GenericImageView, ImageBuffer, Pixel};
use ndarray::{concatenate, Array4, Axis};
use rayon::prelude::*;
use std::path::Path;

use crate::error::{ClipError, Result};

pub const CLIP_INPUT_SIZE: u32 = 224;
pub const CROP_CENTER_PADDING: u32 = 224;
pub const NORM_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const NORM_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Side length of the padded square before cropping.
const RESIZED_SQ_SIZE: u32 = CLIP_INPUT_SIZE + 2 * CROP_CENTER_PADDING;

pub fn load_image(path: &Path) -> Result<DynamicImage> {
    Ok(image::open(path)?)
}

/// Resized image, either single-channel or RGB.
enum Resized {
    Gray(ImageBuffer<image::Luma<u8>, Vec<u8>>),
    Rgb(ImageBuffer<image::Rgb<u8>, Vec<u8>>),
}

impl Resized {
    fn dimensions(&self) -> (u32, u32) {
        match self {
            Resized::Gray(buf) => buf.dimensions(),
            Resized::Rgb(buf) => buf.dimensions(),
        }
    }

    /// Channel values at (x, y) in 0..=255; grayscale is replicated.
    fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        match self {
            Resized::Gray(buf) => {
                let v = buf.get_pixel(x, y).channels()[0];
                [v, v, v]
            }
            Resized::Rgb(buf) => buf.get_pixel(x, y).0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Preprocessor;

impl Preprocessor {
    pub fn new() -> Self {
        Self
    }

    /// Preprocess one image into a `[1, 3, 224, 224]` tensor.
    pub fn encode_image(&self, img: &DynamicImage) -> Result<Array4<f32>> {
        let (w, h) = img.dimensions();
        if w == 0 || h == 0 {
            return Err(ClipError::InvalidImage(format!("image has zero size ({w}x{h})")));
        }

        let resized = smart_resize(img);
        let (rw, rh) = resized.dimensions();

        let vert_pad = (RESIZED_SQ_SIZE - rh) / 2;
        let hor_pad = (RESIZED_SQ_SIZE - rw) / 2;

        let size = CLIP_INPUT_SIZE as usize;
        let mut out = Array4::<f32>::zeros((1, 3, size, size));

        for y in 0..CLIP_INPUT_SIZE {
            for x in 0..CLIP_INPUT_SIZE {
                // Position inside the padded square
                let py = y + CROP_CENTER_PADDING;
                let px = x + CROP_CENTER_PADDING;

                let rgb = if py >= vert_pad && py < vert_pad + rh && px >= hor_pad && px < hor_pad + rw {
                    resized.rgb_at(px - hor_pad, py - vert_pad)
                } else {
                    [0, 0, 0]
                };

                for c in 0..3 {
                    let v = rgb[c] as f32 / 255.0;
                    out[[0, c, y as usize, x as usize]] = (v - NORM_MEAN[c]) / NORM_STD[c];
                }
            }
        }

        Ok(out)
    }

    /// Preprocess a batch into a `[n, 3, 224, 224]` tensor, in input order.
    pub fn encode_images(&self, images: &[DynamicImage]) -> Result<Array4<f32>> {
        if images.is_empty() {
            let size = CLIP_INPUT_SIZE as usize;
            return Ok(Array4::zeros((0, 3, size, size)));
        }

        let encoded = images
            .par_iter()
            .map(|img| self.encode_image(img))
            .collect::<Result<Vec<_>>>()?;

        let views: Vec<_> = encoded.iter().map(|a| a.view()).collect();
        Ok(concatenate(Axis(0), &views)?)
    }

    pub fn encode_image_file(&self, path: &Path) -> Result<Array4<f32>> {
        let img = load_image(path)?;
        self.encode_image(&img)
    }
}

/// Target (width, height) that fits the long side to the padded square.
fn resized_dimensions(w: u32, h: u32) -> (u32, u32) {
    let sq = RESIZED_SQ_SIZE as f64;
    let (rw, rh) = if h > w {
        ((sq * w as f64 / h as f64).round_ties_even(), sq)
    } else {
        (sq, (sq * h as f64 / w as f64).round_ties_even())
    };
    ((rw as u32).max(1), (rh as u32).max(1))
}

fn smart_resize(img: &DynamicImage) -> Resized {
    let (w, h) = img.dimensions();
    let (rw, rh) = resized_dimensions(w, h);

    match img.color() {
        ColorType::L8 | ColorType::L16 | ColorType::La8 | ColorType::La16 => {
            Resized::Gray(resize_bilinear(&img.to_luma8(), rw, rh))
        }
        _ => Resized::Rgb(resize_bilinear(&img.to_rgb8(), rw, rh)),
    }
}

/// Source sample for destination index `d`: the two neighbouring indices and
/// the weight of the second. Uses half-pixel centres, clamped at the borders.
fn source_coord(d: u32, scale: f64, len: u32) -> (u32, u32, f32) {
    let s = ((d as f64 + 0.5) * scale - 0.5).max(0.0);
    let last = len - 1;
    let i0 = (s.floor() as u32).min(last);
    if i0 == last {
        return (last, last, 0.0);
    }
    (i0, i0 + 1, (s - i0 as f64) as f32)
}

/// Point-sampled bilinear resize. Unlike a triangle filter, the kernel does
/// not widen when downscaling.
fn resize_bilinear<P>(src: &ImageBuffer<P, Vec<u8>>, width: u32, height: u32) -> ImageBuffer<P, Vec<u8>>
where
    P: Pixel<Subpixel = u8>,
{
    let (sw, sh) = src.dimensions();
    let xs: Vec<_> = (0..width)
        .map(|x| source_coord(x, sw as f64 / width as f64, sw))
        .collect();
    let ys: Vec<_> = (0..height)
        .map(|y| source_coord(y, sh as f64 / height as f64, sh))
        .collect();

    ImageBuffer::from_fn(width, height, |x, y| {
        let (x0, x1, fx) = xs[x as usize];
        let (y0, y1, fy) = ys[y as usize];

        let p00 = src.get_pixel(x0, y0).channels();
        let p10 = src.get_pixel(x1, y0).channels();
        let p01 = src.get_pixel(x0, y1).channels();
        let p11 = src.get_pixel(x1, y1).channels();

        let mut out = *src.get_pixel(x0, y0);
        for (c, v) in out.channels_mut().iter_mut().enumerate() {
            let top = p00[c] as f32 * (1.0 - fx) + p10[c] as f32 * fx;
            let bottom = p01[c] as f32 * (1.0 - fx) + p11[c] as f32 * fx;
            let value = top * (1.0 - fy) + bottom * fy;
            *v = value.round().clamp(0.0, 255.0) as u8;
        }
        out
    })
}
