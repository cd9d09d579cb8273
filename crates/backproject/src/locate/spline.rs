use ndarray::Array3;

/// Cubic Catmull-Rom weights for the four samples around `t` in `[0, 1]`.
fn weights(t: f64) -> [f64; 4] {
	let t2 = t * t;
	let t3 = t2 * t;
	[
		0.5 * (-t3 + 2.0 * t2 - t),
		0.5 * (3.0 * t3 - 5.0 * t2 + 2.0),
		0.5 * (-3.0 * t3 + 4.0 * t2 + t),
		0.5 * (t3 - t2),
	]
}

/// Tricubic Catmull-Rom value of `map` at a fractional index. Neighbours
/// beyond the edge are clamped onto it.
pub(crate) fn interpolate(map: &Array3<f64>, position: [f64; 3]) -> f64 {
	let shape = map.shape();
	let mut base = [0_isize; 3];
	let mut w = [[0.0; 4]; 3];
	for axis in 0..3 {
		let last = shape[axis] as isize - 1;
		let floor = (position[axis].floor() as isize).clamp(0, (last - 1).max(0));
		base[axis] = floor;
		w[axis] = weights((position[axis] - floor as f64).clamp(0.0, 1.0));
	}

	let index = |axis: usize, k: usize| (base[axis] + k as isize - 1).clamp(0, shape[axis] as isize - 1) as usize;
	let mut value = 0.0;
	for i in 0..4 {
		for j in 0..4 {
			for k in 0..4 {
				value += w[0][i] * w[1][j] * w[2][k] * map[[index(0, i), index(1, j), index(2, k)]];
			}
		}
	}
	value
}

/// Sub-cell maximum of `map` inside a `window`-cell cube centred on the
/// gridded maximum `peak`, searched on a lattice `upscale` times finer.
///
/// `None` when the cube would cross the edge of the grid or the refined
/// maximum leaves the cube.
pub(crate) fn refine(map: &Array3<f64>, peak: [usize; 3], window: usize, upscale: usize) -> Option<[f64; 3]> {
	let half = (window - 1) / 2;
	let shape = map.shape();
	for axis in 0..3 {
		if peak[axis] < half || peak[axis] + half >= shape[axis] {
			return None;
		}
	}

	let steps = (window - 1) * upscale;
	let lower = [(peak[0] - half) as f64, (peak[1] - half) as f64, (peak[2] - half) as f64];
	let scale = upscale as f64;

	let mut best = (f64::NEG_INFINITY, [0.0; 3]);
	for i in 0..=steps {
		for j in 0..=steps {
			for k in 0..=steps {
				let position = [lower[0] + i as f64 / scale, lower[1] + j as f64 / scale, lower[2] + k as f64 / scale];
				let value = interpolate(map, position);
				if value > best.0 {
					best = (value, position);
				}
			}
		}
	}

	let position = best.1;
	let inside = (0..3).all(|axis| (position[axis] - peak[axis] as f64).abs() <= half as f64);
	inside.then_some(position)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn gaussian(shape: (usize, usize, usize), centre: [f64; 3], sigma: f64) -> Array3<f64> {
		Array3::from_shape_fn(shape, |(i, j, k)| {
			let d2 = (i as f64 - centre[0]).powi(2) + (j as f64 - centre[1]).powi(2) + (k as f64 - centre[2]).powi(2);
			(-d2 / (2.0 * sigma * sigma)).exp()
		})
	}

	#[test]
	fn test_interpolation_passes_through_nodes() {
		let map = gaussian((6, 6, 6), [2.5, 2.0, 3.0], 1.5);
		assert!((interpolate(&map, [2.0, 3.0, 1.0]) - map[[2, 3, 1]]).abs() < 1e-12);
		assert!((interpolate(&map, [5.0, 5.0, 5.0]) - map[[5, 5, 5]]).abs() < 1e-12);
	}

	#[test]
	fn test_refines_off_node_peak() {
		let centre = [6.3, 5.6, 6.2];
		let map = gaussian((13, 12, 13), centre, 2.0);
		let refined = refine(&map, [6, 6, 6], 5, 10).unwrap();
		for axis in 0..3 {
			assert!((refined[axis] - centre[axis]).abs() < 0.15, "axis {axis}: {refined:?}");
		}
	}

	#[test]
	fn test_window_crossing_edge_falls_back() {
		let map = gaussian((8, 8, 8), [1.0, 4.0, 4.0], 2.0);
		assert!(refine(&map, [1, 4, 4], 5, 10).is_none());
	}
}
