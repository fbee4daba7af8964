use image::GrayImage;
use rayon::prelude::*;

/// Adaptive mean thresholding: a pixel goes white when it is brighter
/// than the mean of its `block_size` neighborhood minus `c`. Uses an
/// integral image so the cost is independent of the block size.
pub fn adaptive_mean_threshold(src: &GrayImage, block_size: u32, c: f64) -> GrayImage {
    let width = src.width() as usize;
    let height = src.height() as usize;
    let half = (block_size / 2).max(1) as isize;

    // Integral image with a one-row/column zero border.
    let mut integral = vec![0u64; (width + 1) * (height + 1)];
    let raw = src.as_raw();
    for y in 0..height {
        let mut row_sum = 0u64;
        for x in 0..width {
            row_sum += raw[y * width + x] as u64;
            integral[(y + 1) * (width + 1) + (x + 1)] =
                integral[y * (width + 1) + (x + 1)] + row_sum;
        }
    }

    let mut dst = GrayImage::new(src.width(), src.height());

    dst.as_mut()
        .par_chunks_mut(width)
        .enumerate()
        .for_each(|(y, row)| {
            let y0 = (y as isize - half).max(0) as usize;
            let y1 = (y as isize + half + 1).min(height as isize) as usize;
            for x in 0..width {
                let x0 = (x as isize - half).max(0) as usize;
                let x1 = (x as isize + half + 1).min(width as isize) as usize;

                let sum = integral[y1 * (width + 1) + x1] + integral[y0 * (width + 1) + x0]
                    - integral[y0 * (width + 1) + x1]
                    - integral[y1 * (width + 1) + x0];
                let area = ((y1 - y0) * (x1 - x0)) as f64;
                let mean = sum as f64 / area;

                row[x] = if raw[y * width + x] as f64 > mean - c {
                    255
                } else {
                    0
                };
            }
        });

    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn splits_bright_and_dark_near_an_edge() {
        let mut img = GrayImage::new(20, 10);
        for y in 0..10 {
            for x in 0..20 {
                let v = if x < 10 { 40 } else { 210 };
                img.put_pixel(x, y, Luma([v]));
            }
        }
        // Within a block of the step the local mean mixes both sides,
        // so the dark pixel falls below it and the bright one above.
        let bin = adaptive_mean_threshold(&img, 7, 5.0);
        assert_eq!(bin.get_pixel(8, 5)[0], 0);
        assert_eq!(bin.get_pixel(11, 5)[0], 255);
    }

    #[test]
    fn flat_image_goes_white_with_positive_offset() {
        let img = GrayImage::from_pixel(8, 8, Luma([128]));
        let bin = adaptive_mean_threshold(&img, 5, 10.0);
        assert!(bin.pixels().all(|p| p[0] == 255));
    }
}
