//! Location uncertainty from the marginal coalescence map: a local Gaussian
//! fit around the peak and a global weighted covariance.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};
use ndarray::{Array3, Axis};

use crate::grid::Grid;
use crate::scan::argmax;

/// Smallest curvature accepted before a sigma is reported as unbounded.
const MIN_CURVATURE: f64 = 1e-10;

/// Separable Gaussian smoothing with `sigma` in cells, zero padded, then
/// normalised to a maximum of one.
pub(crate) fn smooth(map: &Array3<f64>, sigma: f64) -> Array3<f64> {
	if sigma <= 0.0 {
		return normalised(map.clone());
	}
	let radius = (3.0 * sigma).ceil() as isize;
	let kernel: Vec<f64> = (-radius..=radius).map(|d| (-(d * d) as f64 / (2.0 * sigma * sigma)).exp()).collect();

	let mut current = map.clone();
	for axis in 0..3 {
		let len = current.len_of(Axis(axis)) as isize;
		let mut next = Array3::zeros(current.raw_dim());
		for (mut out, lane) in next.lanes_mut(Axis(axis)).into_iter().zip(current.lanes(Axis(axis))) {
			for i in 0..len {
				let mut acc = 0.0;
				for (k, w) in kernel.iter().enumerate() {
					let j = i + k as isize - radius;
					if (0..len).contains(&j) {
						acc += w * lane[j as usize];
					}
				}
				out[i as usize] = acc;
			}
		}
		current = next;
	}
	normalised(current)
}

fn normalised(mut map: Array3<f64>) -> Array3<f64> {
	let max = map.iter().copied().fold(f64::NEG_INFINITY, f64::max);
	if max > 0.0 {
		map.mapv_inplace(|v| v / max);
	}
	map
}

/// Local Gaussian: least-squares quadric fit of `-ln(map - mean)` over the
/// `window`-cell cube around the maximum. Returns the fractional index of
/// the centre and per-axis sigma in cells, or `None` when the fit is
/// degenerate or its centre leaves the cube.
pub(crate) fn gaussian_fit(map: &Array3<f64>, window: usize) -> Option<([f64; 3], [f64; 3])> {
	let flat = map.as_slice()?;
	let shape = map.shape();
	let (peak_flat, _) = argmax(flat);
	let peak = [peak_flat / (shape[1] * shape[2]), (peak_flat / shape[2]) % shape[1], peak_flat % shape[2]];
	let mean = flat.iter().sum::<f64>() / flat.len() as f64;
	let half = ((window - 1) / 2) as isize;

	let mut rows = Vec::new();
	let mut targets = Vec::new();
	for dx in -half..=half {
		for dy in -half..=half {
			for dz in -half..=half {
				let index = [peak[0] as isize + dx, peak[1] as isize + dy, peak[2] as isize + dz];
				if (0..3).any(|a| index[a] < 0 || index[a] >= shape[a] as isize) {
					continue;
				}
				let value = map[[index[0] as usize, index[1] as usize, index[2] as usize]] - mean;
				if value <= 0.0 {
					continue;
				}
				let (x, y, z) = (dx as f64, dy as f64, dz as f64);
				rows.extend_from_slice(&[x * x, y * y, z * z, x * y, x * z, y * z, x, y, z, 1.0]);
				targets.push(-value.ln());
			}
		}
	}
	let n = targets.len();
	if n < 10 {
		return None;
	}

	let design = DMatrix::from_row_slice(n, 10, &rows);
	let target = DVector::from_vec(targets);
	let p = design.svd(true, true).solve(&target, 1e-12).ok()?;

	let gradient = -Matrix3::new(2.0 * p[0], p[3], p[4], p[3], 2.0 * p[1], p[5], p[4], p[5], 2.0 * p[2]);
	let offset = gradient.try_inverse()? * Vector3::new(p[6], p[7], p[8]);
	if offset.iter().any(|o| !o.is_finite() || o.abs() > half as f64) {
		return None;
	}
	if p[0] <= 0.0 || p[1] <= 0.0 || p[2] <= 0.0 {
		return None;
	}

	let centre = [peak[0] as f64 + offset[0], peak[1] as f64 + offset[1], peak[2] as f64 + offset[2]];
	let sigma = [0, 1, 2].map(|i| (0.5 / p[i].abs().max(MIN_CURVATURE)).sqrt());
	Some((centre, sigma))
}

/// Weighted mean position and per-axis standard deviation (metres) of the
/// cells whose normalised value exceeds `threshold`.
pub(crate) fn covariance(map: &Array3<f64>, grid: &Grid, threshold: f64) -> ([f64; 3], [f64; 3]) {
	let mut weight_sum = 0.0;
	let mut first = [0.0; 3];
	let mut samples = Vec::new();
	for ((ix, iy, iz), &value) in map.indexed_iter() {
		if value > threshold {
			let xyz = grid.node_xyz([ix, iy, iz]);
			weight_sum += value;
			for axis in 0..3 {
				first[axis] += value * xyz[axis];
			}
			samples.push((value, xyz));
		}
	}
	if weight_sum <= 0.0 {
		let (peak, _) = argmax(map.as_slice().unwrap_or(&[]));
		return (grid.node_xyz(grid.unflatten(peak)), grid.cell_size());
	}

	let mean = first.map(|s| s / weight_sum);
	let mut variance = [0.0; 3];
	for (value, xyz) in &samples {
		for axis in 0..3 {
			variance[axis] += value * (xyz[axis] - mean[axis]).powi(2);
		}
	}
	(mean, variance.map(|v| (v / weight_sum).sqrt()))
}
