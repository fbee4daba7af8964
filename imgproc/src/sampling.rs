use fisheyecal_core::{Error, Result};
use image::GrayImage;
use rayon::prelude::*;

use crate::{BorderMode, Interpolation};

fn resolve_coord(coord: isize, len: usize, border: BorderMode) -> Option<usize> {
    let n = len as isize;
    if n <= 0 {
        return None;
    }
    match border {
        BorderMode::Constant(_) => {
            if coord < 0 || coord >= n {
                None
            } else {
                Some(coord as usize)
            }
        }
        BorderMode::Replicate => Some(coord.clamp(0, n - 1) as usize),
    }
}

fn read_pixel(img: &GrayImage, x: isize, y: isize, border: BorderMode) -> f32 {
    let width = img.width() as usize;
    let raw = img.as_raw();
    match (
        resolve_coord(x, width, border),
        resolve_coord(y, img.height() as usize, border),
    ) {
        (Some(ix), Some(iy)) => raw[iy * width + ix] as f32,
        _ => match border {
            BorderMode::Constant(v) => v as f32,
            BorderMode::Replicate => 0.0,
        },
    }
}

/// Bilinear read at a fractional coordinate.
pub fn sample_bilinear(img: &GrayImage, x: f32, y: f32, border: BorderMode) -> f32 {
    let x0 = x.floor() as isize;
    let y0 = y.floor() as isize;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let v00 = read_pixel(img, x0, y0, border);
    let v10 = read_pixel(img, x0 + 1, y0, border);
    let v01 = read_pixel(img, x0, y0 + 1, border);
    let v11 = read_pixel(img, x0 + 1, y0 + 1, border);

    let top = v00 * (1.0 - fx) + v10 * fx;
    let bottom = v01 * (1.0 - fx) + v11 * fx;
    top * (1.0 - fy) + bottom * fy
}

pub fn sample_nearest(img: &GrayImage, x: f32, y: f32, border: BorderMode) -> f32 {
    read_pixel(img, x.round() as isize, y.round() as isize, border)
}

fn sample(
    img: &GrayImage,
    x: f32,
    y: f32,
    interpolation: Interpolation,
    border: BorderMode,
) -> f32 {
    match interpolation {
        Interpolation::Nearest => sample_nearest(img, x, y, border),
        Interpolation::Linear => sample_bilinear(img, x, y, border),
    }
}

/// Resample `src` through a dense coordinate lookup: output pixel
/// `(x, y)` reads the source at `(map_x[i], map_y[i])` where
/// `i = y * width + x`. Rows are processed in parallel. Both tables
/// must hold exactly `width * height` entries.
pub fn remap(
    src: &GrayImage,
    map_x: &[f32],
    map_y: &[f32],
    width: u32,
    height: u32,
    interpolation: Interpolation,
    border: BorderMode,
) -> Result<GrayImage> {
    let expected = width as usize * height as usize;
    if map_x.len() != expected || map_y.len() != expected {
        return Err(Error::InvalidConfiguration(format!(
            "remap tables hold {} and {} entries for a {}x{} output",
            map_x.len(),
            map_y.len(),
            width,
            height
        )));
    }

    let mut dst = GrayImage::new(width, height);

    dst.as_mut()
        .par_chunks_mut(width as usize)
        .enumerate()
        .for_each(|(y, row)| {
            let base = y * width as usize;
            for x in 0..width as usize {
                let val = sample(
                    src,
                    map_x[base + x],
                    map_y[base + x],
                    interpolation,
                    border,
                );
                row[x] = val.clamp(0.0, 255.0) as u8;
            }
        });

    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn identity_remap_keeps_pixels() {
        let mut img = GrayImage::new(6, 4);
        img.put_pixel(2, 1, Luma([200]));
        img.put_pixel(4, 3, Luma([123]));

        let mut map_x = vec![0.0f32; 24];
        let mut map_y = vec![0.0f32; 24];
        for y in 0..4u32 {
            for x in 0..6u32 {
                map_x[(y * 6 + x) as usize] = x as f32;
                map_y[(y * 6 + x) as usize] = y as f32;
            }
        }

        let out = remap(
            &img,
            &map_x,
            &map_y,
            6,
            4,
            Interpolation::Nearest,
            BorderMode::Replicate,
        )
        .unwrap();
        assert_eq!(out.get_pixel(2, 1)[0], 200);
        assert_eq!(out.get_pixel(4, 3)[0], 123);
    }

    #[test]
    fn undersized_tables_are_rejected() {
        let img = GrayImage::new(6, 4);
        let map = vec![0.0f32; 10];
        let err = remap(
            &img,
            &map,
            &map,
            6,
            4,
            Interpolation::Linear,
            BorderMode::Constant(0),
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
    }

    #[test]
    fn bilinear_midpoint_averages() {
        let mut img = GrayImage::new(2, 1);
        img.put_pixel(0, 0, Luma([0]));
        img.put_pixel(1, 0, Luma([100]));
        let v = sample_bilinear(&img, 0.5, 0.0, BorderMode::Constant(0));
        assert!((v - 50.0).abs() < 1e-4);
    }

    #[test]
    fn out_of_bounds_uses_border_value() {
        let img = GrayImage::new(3, 3);
        let v = sample_nearest(&img, -5.0, -5.0, BorderMode::Constant(77));
        assert!((v - 77.0).abs() < 1e-6);
    }
}
