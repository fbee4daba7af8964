//! Checkerboard corner extraction.
//!
//! Detection is all-or-nothing: either every inner corner of the
//! configured pattern is located with geometric consistency, ordered
//! row-major from the top-left of the image, or the whole frame is
//! rejected with [`CalibError::PatternNotFound`] so callers can drop it
//! from the calibration set.

use fisheyecal_core::PatternGeometry;
use fisheyecal_imgproc::adaptive_mean_threshold;
use image::GrayImage;
use nalgebra::{Matrix2, Point2, SymmetricEigen, Vector2};
use rayon::prelude::*;

use crate::{CalibError, Result};

const THRESH_BLOCK: u32 = 31;
const THRESH_OFFSET: f64 = 8.0;
const SIGNATURE_OFFSET: i32 = 3;
const SUBPIX_WINDOW_RADIUS: usize = 5;
const SUBPIX_MAX_ITERS: usize = 30;
const SUBPIX_EPS: f64 = 0.1;

/// Locate the full grid of inner checkerboard corners at sub-pixel
/// accuracy, row-major.
pub fn find_board_corners(
    image: &GrayImage,
    geometry: &PatternGeometry,
) -> Result<Vec<Point2<f64>>> {
    let need = geometry.point_count();
    if image.width() < 16 || image.height() < 16 {
        return Err(CalibError::InvalidConfiguration(
            "image too small for checkerboard detection".to_string(),
        ));
    }

    let binary = adaptive_mean_threshold(image, THRESH_BLOCK, THRESH_OFFSET);
    if !has_checkerboard_structure(&binary, geometry.cols()) {
        return Err(CalibError::PatternNotFound(
            "no checkerboard-like intensity structure in frame".to_string(),
        ));
    }

    let (response, width, height) = corner_response(image);
    let max_r = response
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max)
        .max(0.0);
    if max_r <= 0.0 {
        return Err(CalibError::PatternNotFound(
            "no corner-like responses in frame".to_string(),
        ));
    }

    let mut candidates = suppress_non_maxima(&response, width, height, max_r * 0.01);
    candidates.retain(|&(x, y, _)| is_x_corner(&binary, x as i32, y as i32));
    candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    let mut candidates = suppress_close_candidates(&candidates, SIGNATURE_OFFSET as f64);
    if candidates.len() < need {
        return Err(CalibError::PatternNotFound(format!(
            "only {} corner candidates for a {} point pattern",
            candidates.len(),
            need
        )));
    }
    candidates.truncate((need * 4).max(need));

    let mut ordered = assemble_grid(&candidates, geometry)?;
    validate_grid(&ordered, geometry)?;

    refine_corners_subpix(
        image,
        &mut ordered,
        SUBPIX_WINDOW_RADIUS,
        SUBPIX_MAX_ITERS,
        SUBPIX_EPS,
    )?;
    // Refinement can merge near-duplicate candidates onto one physical
    // corner; the grid must still be consistent afterwards.
    validate_grid(&ordered, geometry)?;
    Ok(ordered)
}

/// Fast pre-check on the binarized frame: some scanline must cross at
/// least one black/white alternation per pattern column before any
/// corner work is worth doing.
fn has_checkerboard_structure(binary: &GrayImage, cols: usize) -> bool {
    let height = binary.height();
    let width = binary.width();
    let samples = 16.min(height);
    let mut best = 0usize;
    for i in 0..samples {
        let y = i * height / samples;
        let mut transitions = 0usize;
        let mut prev = binary.get_pixel(0, y)[0];
        for x in 1..width {
            let v = binary.get_pixel(x, y)[0];
            if v != prev {
                transitions += 1;
                prev = v;
            }
        }
        best = best.max(transitions);
    }
    best >= cols
}

/// Harris-style corner response on central-difference gradients.
fn corner_response(image: &GrayImage) -> (Vec<f64>, usize, usize) {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let mut ix = vec![0.0f64; width * height];
    let mut iy = vec![0.0f64; width * height];

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let gx = image.get_pixel((x + 1) as u32, y as u32)[0] as f64
                - image.get_pixel((x - 1) as u32, y as u32)[0] as f64;
            let gy = image.get_pixel(x as u32, (y + 1) as u32)[0] as f64
                - image.get_pixel(x as u32, (y - 1) as u32)[0] as f64;
            ix[y * width + x] = gx * 0.5;
            iy[y * width + x] = gy * 0.5;
        }
    }

    let k = 0.04;
    let win = 2i32;
    let mut resp = vec![0.0f64; width * height];
    resp.par_chunks_mut(width)
        .enumerate()
        .skip(win as usize)
        .take(height - 2 * win as usize)
        .for_each(|(y, row)| {
            for x in win as usize..width - win as usize {
                let mut sxx = 0.0;
                let mut sxy = 0.0;
                let mut syy = 0.0;
                for dy in -win..=win {
                    for dx in -win..=win {
                        let xx = (x as i32 + dx) as usize;
                        let yy = (y as i32 + dy) as usize;
                        let gx = ix[yy * width + xx];
                        let gy = iy[yy * width + xx];
                        sxx += gx * gx;
                        sxy += gx * gy;
                        syy += gy * gy;
                    }
                }
                let det = sxx * syy - sxy * sxy;
                let trace = sxx + syy;
                row[x] = det - k * trace * trace;
            }
        });
    (resp, width, height)
}

fn suppress_non_maxima(
    response: &[f64],
    width: usize,
    height: usize,
    threshold: f64,
) -> Vec<(f64, f64, f64)> {
    let mut out = Vec::new();
    for y in 1..height - 1 {
        for x in 1..width - 1 {
            let r = response[y * width + x];
            if r <= threshold {
                continue;
            }
            let mut is_max = true;
            'nbhd: for yy in (y - 1)..=(y + 1) {
                for xx in (x - 1)..=(x + 1) {
                    if xx == x && yy == y {
                        continue;
                    }
                    let n = response[yy * width + xx];
                    // Plateau ties go to the first pixel in scan order,
                    // so one flat peak yields one candidate.
                    if n > r || (n == r && (yy, xx) < (y, x)) {
                        is_max = false;
                        break 'nbhd;
                    }
                }
            }
            if is_max {
                out.push((x as f64, y as f64, r));
            }
        }
    }
    out
}

/// Greedy minimum-separation suppression over response-sorted
/// candidates. Two valid x-corners cannot sit closer than the quadrant
/// signature offset, so a weaker candidate inside that radius is a
/// duplicate response peak of the same physical corner.
fn suppress_close_candidates(
    sorted: &[(f64, f64, f64)],
    min_dist: f64,
) -> Vec<(f64, f64, f64)> {
    let mut kept: Vec<(f64, f64, f64)> = Vec::with_capacity(sorted.len());
    for &(x, y, r) in sorted {
        let duplicate = kept
            .iter()
            .any(|&(kx, ky, _)| (kx - x).powi(2) + (ky - y).powi(2) < min_dist * min_dist);
        if !duplicate {
            kept.push((x, y, r));
        }
    }
    kept
}

/// Quadrant signature of an x-corner on the binarized frame: samples on
/// the same diagonal agree, the two diagonals disagree.
fn is_x_corner(binary: &GrayImage, x: i32, y: i32) -> bool {
    let d = SIGNATURE_OFFSET;
    let w = binary.width() as i32;
    let h = binary.height() as i32;
    if x - d < 0 || y - d < 0 || x + d >= w || y + d >= h {
        return false;
    }
    let at = |dx: i32, dy: i32| binary.get_pixel((x + dx) as u32, (y + dy) as u32)[0] > 127;
    let ne = at(d, -d);
    let sw = at(-d, d);
    let nw = at(-d, -d);
    let se = at(d, d);
    ne == sw && nw == se && ne != nw
}

/// Order candidates into the pattern grid.
///
/// Principal axes of the candidate cloud give a board-aligned frame;
/// axes are oriented deterministically (x component positive, then y)
/// so the traversal order is identical for every frame of the same
/// scene. 1-D k-means along each axis recovers the grid lines, nearest
/// assignment fills the cells.
fn assemble_grid(
    candidates: &[(f64, f64, f64)],
    geometry: &PatternGeometry,
) -> Result<Vec<Point2<f64>>> {
    let cols = geometry.cols();
    let rows = geometry.rows();
    let points: Vec<Vector2<f64>> = candidates
        .iter()
        .map(|(x, y, _)| Vector2::new(*x, *y))
        .collect();

    let mean = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / points.len() as f64;
    let mut cov = Matrix2::<f64>::zeros();
    for p in &points {
        let d = p - mean;
        cov += d * d.transpose();
    }
    cov /= points.len() as f64;

    let eig = SymmetricEigen::new(cov);
    let major = if eig.eigenvalues[0] >= eig.eigenvalues[1] {
        0
    } else {
        1
    };
    let mut e0 = eig.eigenvectors.column(major).into_owned();
    if e0.x < 0.0 || (e0.x == 0.0 && e0.y < 0.0) {
        e0 = -e0;
    }
    let mut e1 = Vector2::new(-e0.y, e0.x);
    if e1.y < 0.0 {
        e1 = -e1;
    }

    let uv: Vec<(f64, f64)> = points
        .iter()
        .map(|p| {
            let d = p - mean;
            (d.dot(&e0), d.dot(&e1))
        })
        .collect();

    let u_vals: Vec<f64> = uv.iter().map(|(u, _)| *u).collect();
    let v_vals: Vec<f64> = uv.iter().map(|(_, v)| *v).collect();
    let mut u_centers = kmeans_1d(&u_vals, cols, 30);
    let mut v_centers = kmeans_1d(&v_vals, rows, 30);
    u_centers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    v_centers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mut used = vec![false; points.len()];
    let mut out = Vec::with_capacity(cols * rows);
    for vc in &v_centers {
        for uc in &u_centers {
            let mut best = None;
            let mut best_cost = f64::INFINITY;
            for (i, (u, v)) in uv.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let du = u - uc;
                let dv = v - vc;
                let cost = du * du + dv * dv;
                if cost < best_cost {
                    best_cost = cost;
                    best = Some(i);
                }
            }
            let idx = best.ok_or_else(|| {
                CalibError::PatternNotFound("could not fill every grid cell".to_string())
            })?;
            used[idx] = true;
            out.push(Point2::new(points[idx][0], points[idx][1]));
        }
    }
    Ok(out)
}

/// Geometric consistency of an assembled grid: projections must be
/// monotone along rows and columns and the spacing near-uniform. Guards
/// against noise clusters and partially visible boards that slipped
/// through candidate selection.
fn validate_grid(grid: &[Point2<f64>], geometry: &PatternGeometry) -> Result<()> {
    let cols = geometry.cols();
    let rows = geometry.rows();

    let first = grid[0];
    let last_in_row = grid[cols - 1];
    let row_dir = Vector2::new(last_in_row.x - first.x, last_in_row.y - first.y);
    let last_in_col = grid[(rows - 1) * cols];
    let col_dir = Vector2::new(last_in_col.x - first.x, last_in_col.y - first.y);
    if row_dir.norm() < 1e-9 || col_dir.norm() < 1e-9 {
        return Err(CalibError::PatternNotFound(
            "assembled grid collapsed to a line".to_string(),
        ));
    }

    let mut gaps = Vec::with_capacity(rows * (cols - 1));
    for row in 0..rows {
        for col in 1..cols {
            let a = grid[row * cols + col - 1];
            let b = grid[row * cols + col];
            let step = Vector2::new(b.x - a.x, b.y - a.y);
            if step.dot(&row_dir) <= 0.0 {
                return Err(CalibError::PatternNotFound(
                    "grid rows are not monotone".to_string(),
                ));
            }
            gaps.push(step.norm());
        }
    }
    for col in 0..cols {
        for row in 1..rows {
            let a = grid[(row - 1) * cols + col];
            let b = grid[row * cols + col];
            let step = Vector2::new(b.x - a.x, b.y - a.y);
            if step.dot(&col_dir) <= 0.0 {
                return Err(CalibError::PatternNotFound(
                    "grid columns are not monotone".to_string(),
                ));
            }
        }
    }

    gaps.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let median = gaps[gaps.len() / 2];
    if median < 1e-9 {
        return Err(CalibError::PatternNotFound(
            "grid spacing collapsed".to_string(),
        ));
    }
    for &g in &gaps {
        if g < 0.4 * median || g > 2.2 * median {
            return Err(CalibError::PatternNotFound(
                "grid spacing is not consistent with a checkerboard".to_string(),
            ));
        }
    }

    // No two cells may hold the same physical corner.
    let min_sep = 0.4 * median;
    for i in 0..grid.len() {
        for j in i + 1..grid.len() {
            if (grid[i] - grid[j]).norm() < min_sep {
                return Err(CalibError::PatternNotFound(
                    "grid contains duplicate corners".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn kmeans_1d(values: &[f64], k: usize, iters: usize) -> Vec<f64> {
    let min_v = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max_v = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if k == 1 || (max_v - min_v).abs() < 1e-12 {
        return vec![0.5 * (min_v + max_v); k];
    }

    let mut centers = (0..k)
        .map(|i| min_v + (i as f64) * (max_v - min_v) / (k as f64 - 1.0))
        .collect::<Vec<_>>();

    for _ in 0..iters {
        let mut sums = vec![0.0f64; k];
        let mut counts = vec![0usize; k];
        for &v in values {
            let mut best = 0usize;
            let mut best_d = (v - centers[0]).abs();
            for (i, &c) in centers.iter().enumerate().skip(1) {
                let d = (v - c).abs();
                if d < best_d {
                    best_d = d;
                    best = i;
                }
            }
            sums[best] += v;
            counts[best] += 1;
        }
        for i in 0..k {
            if counts[i] > 0 {
                centers[i] = sums[i] / counts[i] as f64;
            }
        }
    }
    centers
}

/// Iterative sub-pixel corner refinement.
///
/// Each corner is moved to the point that best satisfies the local
/// gradient constraints: every pixel in the window whose gradient is
/// non-zero votes for the line through itself with that normal, and the
/// weighted normal equations are solved for the intersection. Stops at
/// a displacement below `eps` or after `max_iters` passes.
pub fn refine_corners_subpix(
    image: &GrayImage,
    corners: &mut [Point2<f64>],
    win_radius: usize,
    max_iters: usize,
    eps: f64,
) -> Result<()> {
    if win_radius == 0 {
        return Err(CalibError::InvalidConfiguration(
            "sub-pixel window radius must be >= 1".to_string(),
        ));
    }
    let w = image.width() as i32;
    let h = image.height() as i32;
    let r = win_radius as i32;

    corners.par_iter_mut().for_each(|p| {
        let mut x = p.x;
        let mut y = p.y;
        for _ in 0..max_iters {
            let cx = x.round() as i32;
            let cy = y.round() as i32;

            let mut gxx = 0.0f64;
            let mut gxy = 0.0f64;
            let mut gyy = 0.0f64;
            let mut bx = 0.0f64;
            let mut by = 0.0f64;
            for dy in -r..=r {
                for dx in -r..=r {
                    let xx = cx + dx;
                    let yy = cy + dy;
                    if xx <= 0 || yy <= 0 || xx >= w - 1 || yy >= h - 1 {
                        continue;
                    }
                    let gx = (image.get_pixel((xx + 1) as u32, yy as u32)[0] as f64
                        - image.get_pixel((xx - 1) as u32, yy as u32)[0] as f64)
                        * 0.5;
                    let gy = (image.get_pixel(xx as u32, (yy + 1) as u32)[0] as f64
                        - image.get_pixel(xx as u32, (yy - 1) as u32)[0] as f64)
                        * 0.5;
                    gxx += gx * gx;
                    gxy += gx * gy;
                    gyy += gy * gy;
                    bx += gx * gx * xx as f64 + gx * gy * yy as f64;
                    by += gx * gy * xx as f64 + gy * gy * yy as f64;
                }
            }

            let det = gxx * gyy - gxy * gxy;
            if det.abs() < 1e-9 {
                break;
            }
            let nx = (gyy * bx - gxy * by) / det;
            let ny = (gxx * by - gxy * bx) / det;
            let shift = ((nx - x) * (nx - x) + (ny - y) * (ny - y)).sqrt();
            x = nx;
            y = ny;
            if shift < eps {
                break;
            }
        }
        p.x = x.clamp(0.0, (image.width() - 1) as f64);
        p.y = y.clamp(0.0, (image.height() - 1) as f64);
    });
    Ok(())
}
