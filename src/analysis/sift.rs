//! Scale-invariant feature transform.
//!
//! Keypoints are Difference-of-Gaussian extrema refined to sub-pixel
//! accuracy, each with a dominant gradient orientation and a 4x4x8
//! gradient histogram descriptor. Parameters follow Lowe (2004) and the
//! OpenCV defaults so that a region that was resized or rotated before being
//! pasted still produces descriptors close to those of its source.

use image::DynamicImage;
use log::debug;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    FeatureSet, Keypoint, Point,
    error::{ForensicsError, Result},
    image_utils::{downsample_2x, gaussian_blur, gray_to_array, to_gray, upsample_2x},
};

pub const DESCRIPTOR_SIZE: usize = DESCRIPTOR_WIDTH * DESCRIPTOR_WIDTH * DESCRIPTOR_BINS;

const DESCRIPTOR_WIDTH: usize = 4;
const DESCRIPTOR_BINS: usize = 8;
const DESCRIPTOR_SCALE_FACTOR: f32 = 3.0;
const DESCRIPTOR_MAG_THRESHOLD: f32 = 0.2;
const DESCRIPTOR_INT_FACTOR: f32 = 512.0;

const ORI_HIST_BINS: usize = 36;
const ORI_SIG_FACTOR: f32 = 1.5;
const ORI_RADIUS: f32 = 3.0 * ORI_SIG_FACTOR;
const ORI_PEAK_RATIO: f32 = 0.8;

const INIT_SIGMA: f32 = 0.5;
const IMAGE_BORDER: usize = 5;
const MAX_INTERP_STEPS: usize = 5;
const ANGLE_EPSILON: f32 = f32::EPSILON * 360.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiftConfig {
    pub octave_layers: usize,
    pub contrast_threshold: f32,
    pub edge_threshold: f32,
    pub sigma: f32,
    /// Double the image before building the first octave.
    pub upsample: bool,
}

impl Default for SiftConfig {
    fn default() -> Self {
        Self {
            octave_layers: 3,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            sigma: 1.6,
            upsample: true,
        }
    }
}

impl SiftConfig {
    pub fn validate(&self) -> Result<()> {
        if self.octave_layers == 0 {
            return Err(ForensicsError::InvalidParameter(
                "SIFT needs at least one layer per octave".into(),
            ));
        }
        if self.contrast_threshold <= 0.0 || self.edge_threshold <= 0.0 || self.sigma <= 0.0 {
            return Err(ForensicsError::InvalidParameter(
                "SIFT thresholds and sigma must be positive".into(),
            ));
        }
        Ok(())
    }
}

struct ScaleSpace {
    gaussians: Vec<Vec<Array2<f32>>>,
    dogs: Vec<Vec<Array2<f32>>>,
}

#[derive(Debug, Clone, Copy)]
struct Extremum {
    octave: usize,
    layer: usize,
    row: usize,
    col: usize,
    offset_x: f32,
    offset_y: f32,
    offset_layer: f32,
    response: f32,
}

/// A refined extremum with one orientation, in octave-local coordinates.
#[derive(Debug, Clone, Copy)]
struct OrientedPoint {
    octave: usize,
    layer: usize,
    local_x: f32,
    local_y: f32,
    local_scale: f32,
    keypoint: Keypoint,
}

pub struct SiftExtractor {
    config: SiftConfig,
}

impl SiftExtractor {
    pub fn new(config: SiftConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn extract(&self, image: &DynamicImage) -> Result<FeatureSet> {
        let gray = to_gray(image)?;
        let mut base = gray_to_array(&gray);
        if self.config.upsample {
            base = upsample_2x(&base);
        }
        let base = self.initial_blur(&base);

        let (height, width) = base.dim();
        let octaves = self.octave_count(height, width);
        if octaves == 0 {
            debug!("image {}x{} too small for a scale space", gray.width(), gray.height());
            return Ok(FeatureSet::empty(DESCRIPTOR_SIZE));
        }

        let space = self.build_scale_space(base, octaves);

        let extrema = (0..octaves)
            .into_par_iter()
            .map(|octave| self.find_extrema(&space, octave))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        let mut oriented = extrema
            .par_iter()
            .map(|extremum| self.assign_orientations(&space, extremum))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        remove_duplicates(&mut oriented);

        let descriptors = oriented
            .par_iter()
            .map(|point| self.compute_descriptor(&space, point))
            .collect::<Vec<_>>();

        let keypoints = oriented.iter().map(|p| p.keypoint).collect::<Vec<_>>();
        let flat = descriptors.into_iter().flatten().collect::<Vec<_>>();
        let descriptors = Array2::from_shape_vec((keypoints.len(), DESCRIPTOR_SIZE), flat)
            .map_err(|e| ForensicsError::InvalidImage(e.to_string()))?;

        debug!(
            "extracted {} keypoints from {} extrema over {} octaves",
            keypoints.len(),
            extrema.len(),
            octaves
        );

        Ok(FeatureSet {
            keypoints,
            descriptors,
        })
    }

    fn initial_blur(&self, base: &Array2<f32>) -> Array2<f32> {
        let assumed = if self.config.upsample {
            INIT_SIGMA * 2.0
        } else {
            INIT_SIGMA
        };
        let sigma_diff = (self.config.sigma.powi(2) - assumed.powi(2)).max(0.01).sqrt();
        gaussian_blur(base, sigma_diff)
    }

    fn octave_count(&self, height: usize, width: usize) -> usize {
        let min_dim = height.min(width);
        if min_dim == 0 {
            return 0;
        }
        let first_octave_shift = if self.config.upsample { 1.0 } else { 0.0 };
        let count = ((min_dim as f32).log2() - 2.0).round() + first_octave_shift;
        count.max(0.0) as usize
    }

    fn layer_sigmas(&self) -> Vec<f32> {
        let layers = self.config.octave_layers;
        let k = 2f32.powf(1.0 / layers as f32);
        let mut sigmas = vec![self.config.sigma; layers + 3];

        for (i, sigma) in sigmas.iter_mut().enumerate().skip(1) {
            let previous = k.powi(i as i32 - 1) * self.config.sigma;
            let total = previous * k;
            *sigma = (total * total - previous * previous).sqrt();
        }

        sigmas
    }

    fn build_scale_space(&self, base: Array2<f32>, octaves: usize) -> ScaleSpace {
        let layers = self.config.octave_layers;
        let sigmas = self.layer_sigmas();
        let mut gaussians: Vec<Vec<Array2<f32>>> = Vec::with_capacity(octaves);

        for octave in 0..octaves {
            let first = match gaussians.last() {
                None => base.clone(),
                Some(previous) => downsample_2x(&previous[layers]),
            };
            let mut images = Vec::with_capacity(layers + 3);
            images.push(first);

            for sigma in sigmas.iter().skip(1) {
                let next = gaussian_blur(&images[images.len() - 1], *sigma);
                images.push(next);
            }

            debug!("octave {} built at {:?}", octave, images[0].dim());
            gaussians.push(images);
        }

        let dogs = gaussians
            .iter()
            .map(|images| images.windows(2).map(|w| &w[1] - &w[0]).collect())
            .collect();

        ScaleSpace { gaussians, dogs }
    }

    fn find_extrema(&self, space: &ScaleSpace, octave: usize) -> Vec<Extremum> {
        let layers = self.config.octave_layers;
        let threshold = 0.5 * self.config.contrast_threshold / layers as f32;
        let dogs = &space.dogs[octave];
        let mut extrema = Vec::new();

        for layer in 1..=layers {
            let current = &dogs[layer];
            let (rows, cols) = current.dim();
            if rows <= 2 * IMAGE_BORDER || cols <= 2 * IMAGE_BORDER {
                continue;
            }

            for row in IMAGE_BORDER..rows - IMAGE_BORDER {
                for col in IMAGE_BORDER..cols - IMAGE_BORDER {
                    let value = current[[row, col]];
                    if value.abs() <= threshold {
                        continue;
                    }
                    if !is_local_extremum(&dogs[layer - 1..=layer + 1], row, col, value) {
                        continue;
                    }
                    if let Some(extremum) = self.refine_extremum(dogs, octave, layer, row, col) {
                        extrema.push(extremum);
                    }
                }
            }
        }

        extrema
    }

    /// Quadratic fit of the DoG around an extremum; rejects unstable,
    /// low-contrast and edge-like responses.
    fn refine_extremum(
        &self,
        dogs: &[Array2<f32>],
        octave: usize,
        layer: usize,
        row: usize,
        col: usize,
    ) -> Option<Extremum> {
        let layers = self.config.octave_layers;
        let (rows, cols) = dogs[layer].dim();
        let (mut layer, mut row, mut col) = (layer as isize, row as isize, col as isize);
        let mut offset = [0.0f32; 3];
        let mut converged = false;

        for _ in 0..MAX_INTERP_STEPS {
            let (gradient, hessian) =
                derivatives(dogs, layer as usize, row as usize, col as usize);
            let solution = solve_3x3(&hessian, &gradient);
            offset = [-solution[0], -solution[1], -solution[2]];

            if offset.iter().all(|v| v.abs() < 0.5) {
                converged = true;
                break;
            }
            if offset.iter().any(|v| !v.is_finite() || v.abs() > (i32::MAX / 3) as f32) {
                return None;
            }

            col += offset[0].round() as isize;
            row += offset[1].round() as isize;
            layer += offset[2].round() as isize;

            if layer < 1
                || layer > layers as isize
                || col < IMAGE_BORDER as isize
                || col >= (cols - IMAGE_BORDER) as isize
                || row < IMAGE_BORDER as isize
                || row >= (rows - IMAGE_BORDER) as isize
            {
                return None;
            }
        }

        if !converged {
            return None;
        }

        let (layer, row, col) = (layer as usize, row as usize, col as usize);
        let (gradient, hessian) = derivatives(dogs, layer, row, col);
        let t = gradient[0] * offset[0] + gradient[1] * offset[1] + gradient[2] * offset[2];
        let contrast = dogs[layer][[row, col]] + t * 0.5;
        if contrast.abs() * (layers as f32) < self.config.contrast_threshold {
            return None;
        }

        let (dxx, dyy, dxy) = (hessian[0][0], hessian[1][1], hessian[0][1]);
        let trace = dxx + dyy;
        let det = dxx * dyy - dxy * dxy;
        let edge = self.config.edge_threshold;
        if det <= 0.0 || trace * trace * edge >= (edge + 1.0).powi(2) * det {
            return None;
        }

        Some(Extremum {
            octave,
            layer,
            row,
            col,
            offset_x: offset[0],
            offset_y: offset[1],
            offset_layer: offset[2],
            response: contrast.abs(),
        })
    }

    fn assign_orientations(&self, space: &ScaleSpace, extremum: &Extremum) -> Vec<OrientedPoint> {
        let layers = self.config.octave_layers as f32;
        let image = &space.gaussians[extremum.octave][extremum.layer];
        let local_scale = self.config.sigma
            * 2f32.powf((extremum.layer as f32 + extremum.offset_layer) / layers);

        let hist = orientation_histogram(
            image,
            extremum.row as isize,
            extremum.col as isize,
            (ORI_RADIUS * local_scale).round() as isize,
            ORI_SIG_FACTOR * local_scale,
        );

        let octave_scale = 2f32.powi(extremum.octave as i32);
        let image_scale = if self.config.upsample { 0.5 } else { 1.0 };
        let local_x = extremum.col as f32 + extremum.offset_x;
        let local_y = extremum.row as f32 + extremum.offset_y;

        let max = hist.iter().cloned().fold(0.0f32, f32::max);
        let threshold = max * ORI_PEAK_RATIO;
        let n = ORI_HIST_BINS;
        let mut oriented = Vec::new();

        for j in 0..n {
            let left = hist[(j + n - 1) % n];
            let right = hist[(j + 1) % n];
            if hist[j] <= left || hist[j] <= right || hist[j] < threshold {
                continue;
            }

            let mut bin = j as f32 + 0.5 * (left - right) / (left - 2.0 * hist[j] + right);
            if bin < 0.0 {
                bin += n as f32;
            } else if bin >= n as f32 {
                bin -= n as f32;
            }
            let mut angle = 360.0 - (360.0 / n as f32) * bin;
            if (angle - 360.0).abs() < ANGLE_EPSILON {
                angle = 0.0;
            }

            oriented.push(OrientedPoint {
                octave: extremum.octave,
                layer: extremum.layer,
                local_x,
                local_y,
                local_scale,
                keypoint: Keypoint {
                    point: Point::new(
                        local_x * octave_scale * image_scale,
                        local_y * octave_scale * image_scale,
                    ),
                    size: local_scale * 2.0 * octave_scale * image_scale,
                    angle,
                    response: extremum.response,
                    octave: extremum.octave,
                },
            });
        }

        oriented
    }

    fn compute_descriptor(&self, space: &ScaleSpace, point: &OrientedPoint) -> Vec<f32> {
        let image = &space.gaussians[point.octave][point.layer];
        let mut angle = 360.0 - point.keypoint.angle;
        if (angle - 360.0).abs() < ANGLE_EPSILON {
            angle = 0.0;
        }
        descriptor_at(image, point.local_x, point.local_y, angle, point.local_scale)
    }
}

fn is_local_extremum(dogs: &[Array2<f32>], row: usize, col: usize, value: f32) -> bool {
    let neighbours = || {
        dogs.iter().flat_map(move |dog| {
            (row - 1..=row + 1)
                .flat_map(move |r| (col - 1..=col + 1).map(move |c| dog[[r, c]]))
        })
    };

    if value > 0.0 {
        neighbours().all(|v| value >= v)
    } else {
        neighbours().all(|v| value <= v)
    }
}

/// Finite-difference gradient `(dx, dy, ds)` and Hessian at a DoG sample.
fn derivatives(
    dogs: &[Array2<f32>],
    layer: usize,
    row: usize,
    col: usize,
) -> ([f32; 3], [[f32; 3]; 3]) {
    let (prev, img, next) = (&dogs[layer - 1], &dogs[layer], &dogs[layer + 1]);
    let (r, c) = (row, col);

    let gradient = [
        (img[[r, c + 1]] - img[[r, c - 1]]) * 0.5,
        (img[[r + 1, c]] - img[[r - 1, c]]) * 0.5,
        (next[[r, c]] - prev[[r, c]]) * 0.5,
    ];

    let v2 = img[[r, c]] * 2.0;
    let dxx = img[[r, c + 1]] + img[[r, c - 1]] - v2;
    let dyy = img[[r + 1, c]] + img[[r - 1, c]] - v2;
    let dss = next[[r, c]] + prev[[r, c]] - v2;
    let dxy = (img[[r + 1, c + 1]] - img[[r + 1, c - 1]] - img[[r - 1, c + 1]]
        + img[[r - 1, c - 1]])
        * 0.25;
    let dxs = (next[[r, c + 1]] - next[[r, c - 1]] - prev[[r, c + 1]] + prev[[r, c - 1]]) * 0.25;
    let dys = (next[[r + 1, c]] - next[[r - 1, c]] - prev[[r + 1, c]] + prev[[r - 1, c]]) * 0.25;

    let hessian = [[dxx, dxy, dxs], [dxy, dyy, dys], [dxs, dys, dss]];
    (gradient, hessian)
}

/// Cramer's rule; a singular system yields the zero vector.
fn solve_3x3(m: &[[f32; 3]; 3], b: &[f32; 3]) -> [f32; 3] {
    let m = m.map(|row| row.map(|v| v as f64));
    let b = b.map(|v| v as f64);
    let det3 = |a: &[[f64; 3]; 3]| {
        a[0][0] * (a[1][1] * a[2][2] - a[1][2] * a[2][1])
            - a[0][1] * (a[1][0] * a[2][2] - a[1][2] * a[2][0])
            + a[0][2] * (a[1][0] * a[2][1] - a[1][1] * a[2][0])
    };

    let det = det3(&m);
    if det.abs() < 1e-12 {
        return [0.0; 3];
    }

    let mut solution = [0.0f32; 3];
    for (i, value) in solution.iter_mut().enumerate() {
        let mut replaced = m;
        for row in 0..3 {
            replaced[row][i] = b[row];
        }
        *value = (det3(&replaced) / det) as f32;
    }
    solution
}

/// Gradient angle in degrees within `[0, 360)`; image rows grow downwards
/// so `dy` is taken upwards.
fn gradient_at(image: &Array2<f32>, row: usize, col: usize) -> (f32, f32) {
    let dx = image[[row, col + 1]] - image[[row, col - 1]];
    let dy = image[[row - 1, col]] - image[[row + 1, col]];
    let mut angle = dy.atan2(dx).to_degrees();
    if angle < 0.0 {
        angle += 360.0;
    }
    (angle, (dx * dx + dy * dy).sqrt())
}

fn orientation_histogram(
    image: &Array2<f32>,
    row: isize,
    col: isize,
    radius: isize,
    sigma: f32,
) -> [f32; ORI_HIST_BINS] {
    let (rows, cols) = image.dim();
    let n = ORI_HIST_BINS;
    let exp_scale = -1.0 / (2.0 * sigma * sigma);
    let mut raw = [0.0f32; ORI_HIST_BINS];

    for i in -radius..=radius {
        let y = row + i;
        if y <= 0 || y >= rows as isize - 1 {
            continue;
        }
        for j in -radius..=radius {
            let x = col + j;
            if x <= 0 || x >= cols as isize - 1 {
                continue;
            }

            let (angle, magnitude) = gradient_at(image, y as usize, x as usize);
            let weight = (((i * i + j * j) as f32) * exp_scale).exp();
            let bin = ((n as f32 / 360.0) * angle).round() as isize;
            let bin = bin.rem_euclid(n as isize) as usize;
            raw[bin] += weight * magnitude;
        }
    }

    let mut smoothed = [0.0f32; ORI_HIST_BINS];
    for (i, value) in smoothed.iter_mut().enumerate() {
        let at = |offset: isize| raw[(i as isize + offset).rem_euclid(n as isize) as usize];
        *value = (at(-2) + at(2)) * (1.0 / 16.0)
            + (at(-1) + at(1)) * (4.0 / 16.0)
            + at(0) * (6.0 / 16.0);
    }
    smoothed
}

fn descriptor_at(image: &Array2<f32>, x: f32, y: f32, angle: f32, scale: f32) -> Vec<f32> {
    let (rows, cols) = image.dim();
    let d = DESCRIPTOR_WIDTH;
    let n = DESCRIPTOR_BINS;
    let (px, py) = (x.round() as isize, y.round() as isize);

    let (sin_t, cos_t) = angle.to_radians().sin_cos();
    let bins_per_degree = n as f32 / 360.0;
    let exp_scale = -1.0 / (d as f32 * d as f32 * 0.5);
    let hist_width = DESCRIPTOR_SCALE_FACTOR * scale;
    let radius = (hist_width * std::f32::consts::SQRT_2 * (d as f32 + 1.0) * 0.5).round();
    let radius = radius.min(((rows * rows + cols * cols) as f32).sqrt()) as isize;
    let (cos_t, sin_t) = (cos_t / hist_width, sin_t / hist_width);

    let mut hist = vec![0.0f32; (d + 2) * (d + 2) * (n + 2)];

    for i in -radius..=radius {
        for j in -radius..=radius {
            let c_rot = j as f32 * cos_t - i as f32 * sin_t;
            let r_rot = j as f32 * sin_t + i as f32 * cos_t;
            let rbin = r_rot + d as f32 / 2.0 - 0.5;
            let cbin = c_rot + d as f32 / 2.0 - 0.5;
            let (r, c) = (py + i, px + j);

            if rbin <= -1.0
                || rbin >= d as f32
                || cbin <= -1.0
                || cbin >= d as f32
                || r <= 0
                || r >= rows as isize - 1
                || c <= 0
                || c >= cols as isize - 1
            {
                continue;
            }

            let (gradient_angle, magnitude) = gradient_at(image, r as usize, c as usize);
            let weight = ((c_rot * c_rot + r_rot * r_rot) * exp_scale).exp();
            let obin = (gradient_angle - angle) * bins_per_degree;
            accumulate_trilinear(&mut hist, rbin, cbin, obin, magnitude * weight);
        }
    }

    let mut descriptor = vec![0.0f32; DESCRIPTOR_SIZE];
    for i in 0..d {
        for j in 0..d {
            let idx = ((i + 1) * (d + 2) + (j + 1)) * (n + 2);
            hist[idx] += hist[idx + n];
            hist[idx + 1] += hist[idx + n + 1];
            for k in 0..n {
                descriptor[(i * d + j) * n + k] = hist[idx + k];
            }
        }
    }

    normalize_descriptor(&mut descriptor);
    descriptor
}

fn accumulate_trilinear(hist: &mut [f32], rbin: f32, cbin: f32, obin: f32, magnitude: f32) {
    let d = DESCRIPTOR_WIDTH;
    let n = DESCRIPTOR_BINS;

    let (r0, c0, o0) = (rbin.floor(), cbin.floor(), obin.floor());
    let (rbin, cbin, obin) = (rbin - r0, cbin - c0, obin - o0);
    let o0 = (o0 as isize).rem_euclid(n as isize) as usize;
    let (r0, c0) = (r0 as isize, c0 as isize);

    let v_r1 = magnitude * rbin;
    let v_r0 = magnitude - v_r1;
    let v_rc11 = v_r1 * cbin;
    let v_rc10 = v_r1 - v_rc11;
    let v_rc01 = v_r0 * cbin;
    let v_rc00 = v_r0 - v_rc01;
    let v_rco111 = v_rc11 * obin;
    let v_rco110 = v_rc11 - v_rco111;
    let v_rco101 = v_rc10 * obin;
    let v_rco100 = v_rc10 - v_rco101;
    let v_rco011 = v_rc01 * obin;
    let v_rco010 = v_rc01 - v_rco011;
    let v_rco001 = v_rc00 * obin;
    let v_rco000 = v_rc00 - v_rco001;

    let idx = (((r0 + 1) * (d as isize + 2) + c0 + 1) * (n as isize + 2)) as usize + o0;
    let row_stride = (d + 2) * (n + 2);
    let col_stride = n + 2;

    hist[idx] += v_rco000;
    hist[idx + 1] += v_rco001;
    hist[idx + col_stride] += v_rco010;
    hist[idx + col_stride + 1] += v_rco011;
    hist[idx + row_stride] += v_rco100;
    hist[idx + row_stride + 1] += v_rco101;
    hist[idx + row_stride + col_stride] += v_rco110;
    hist[idx + row_stride + col_stride + 1] += v_rco111;
}

fn normalize_descriptor(descriptor: &mut [f32]) {
    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    let threshold = norm * DESCRIPTOR_MAG_THRESHOLD;
    descriptor.iter_mut().for_each(|v| *v = v.min(threshold));

    let norm = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    let factor = DESCRIPTOR_INT_FACTOR / norm.max(f32::EPSILON);
    descriptor
        .iter_mut()
        .for_each(|v| *v = (*v * factor).round().clamp(0.0, 255.0));
}

fn remove_duplicates(points: &mut Vec<OrientedPoint>) {
    let key = |p: &OrientedPoint| {
        let k = p.keypoint;
        [k.point.x, k.point.y, k.size, k.angle]
    };
    points.sort_by(|a, b| {
        let (ka, kb) = (key(a), key(b));
        ka.iter()
            .zip(kb.iter())
            .map(|(x, y)| x.total_cmp(y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    points.dedup_by(|a, b| key(a) == key(b));
}
