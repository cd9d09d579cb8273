//! Travel-time lookup table: one-way P and S times from every station to
//! every grid node.

mod eikonal;
pub mod persist;
mod velocity;

use std::fmt;

use ndarray::{Array3, Array5, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use self::eikonal::FastMarching;
pub use self::velocity::{ExternalTimes, Layer, LayeredModel, VelocityModel};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::station::Station;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
	P,
	S,
}

impl Phase {
	pub const ALL: [Self; 2] = [Self::P, Self::S];

	#[must_use]
	pub const fn index(self) -> usize {
		match self {
			Self::P => 0,
			Self::S => 1,
		}
	}
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::P => write!(f, "P"),
			Self::S => write!(f, "S"),
		}
	}
}

/// Dense `[station, phase, x, y, z]` table of travel times in seconds.
///
/// Read-only once built; share it by reference between scan and locate
/// workers.
#[derive(Debug, Clone)]
pub struct TravelTimeTable {
	grid: Grid,
	stations: Vec<Station>,
	times: Array5<f64>,
}

impl TravelTimeTable {
	pub fn build(grid: Grid, stations: Vec<Station>, model: &VelocityModel) -> Result<Self> {
		if stations.is_empty() {
			return Err(Error::config("a travel-time table needs at least one station"));
		}
		let [nx, ny, nz] = grid.cell_count();
		info!(method = model.name(), stations = stations.len(), nx, ny, nz, "Building travel-time table");

		let per_station: Vec<[Array3<f64>; 2]> = match model {
			VelocityModel::External(external) => external_times(&grid, stations.len(), external)?,
			_ => stations
				.par_iter()
				.map(|station| {
					let p = station_times(&grid, station, Phase::P, model)?;
					let s = station_times(&grid, station, Phase::S, model)?;
					debug!(station = %station.name, "Travel times computed");
					Ok([p, s])
				})
				.collect::<Result<_>>()?,
		};

		let mut times = Array5::zeros((stations.len(), 2, nx, ny, nz));
		for (index, phases) in per_station.iter().enumerate() {
			for phase in Phase::ALL {
				times.slice_mut(s![index, phase.index(), .., .., ..]).assign(&phases[phase.index()]);
			}
		}

		Self::from_parts(grid, stations, times)
	}

	/// Wraps an existing time array after checking its shape against the grid
	/// and station set, and that every time is finite and non-negative.
	pub fn from_parts(grid: Grid, stations: Vec<Station>, times: Array5<f64>) -> Result<Self> {
		let [nx, ny, nz] = grid.cell_count();
		let expected = [stations.len(), 2, nx, ny, nz];
		if times.shape() != expected {
			return Err(Error::geometry(format!(
				"travel-time array has shape {:?}, grid and stations require {expected:?}",
				times.shape()
			)));
		}

		for (index, station) in stations.iter().enumerate() {
			for phase in Phase::ALL {
				let view = times.slice(s![index, phase.index(), .., .., ..]);
				if let Some(bad) = view.iter().find(|t| !t.is_finite() || **t < 0.0) {
					return Err(Error::model(format!(
						"station {} ({phase}) has invalid travel time {bad}",
						station.name
					)));
				}
			}
		}

		Ok(Self { grid, stations, times })
	}

	#[must_use]
	pub const fn grid(&self) -> &Grid {
		&self.grid
	}

	#[must_use]
	pub fn stations(&self) -> &[Station] {
		&self.stations
	}

	#[must_use]
	pub const fn times(&self) -> &Array5<f64> {
		&self.times
	}

	#[must_use]
	pub fn n_stations(&self) -> usize {
		self.stations.len()
	}

	#[must_use]
	pub fn travel_time(&self, station: usize, phase: Phase, index: [usize; 3]) -> f64 {
		self.times[[station, phase.index(), index[0], index[1], index[2]]]
	}

	#[must_use]
	pub fn max_travel_time(&self) -> f64 {
		self.times.iter().copied().fold(0.0, f64::max)
	}

	/// Sub-samples the table onto the decimated grid. Times are copied from
	/// the retained nodes, never recomputed.
	pub fn decimate(&self, factors: [usize; 3]) -> Result<Self> {
		let (grid, first) = self.grid.decimate(factors)?;
		if factors == [1, 1, 1] {
			return Ok(self.clone());
		}

		let counts = grid.cell_count();
		let end = |axis: usize| first[axis] + factors[axis] * (counts[axis] - 1) + 1;
		let step = |axis: usize| factors[axis] as isize;
		let times = self
			.times
			.slice(s![
				..,
				..,
				first[0]..end(0);step(0),
				first[1]..end(1);step(1),
				first[2]..end(2);step(2)
			])
			.to_owned();

		debug!(?factors, cells = grid.n_cells(), "Decimated travel-time table");
		Ok(Self { grid, stations: self.stations.clone(), times })
	}

	/// Travel times rounded to whole samples at `sampling_rate`, laid out
	/// cell-major for the stacking kernels. Shifts never exceed
	/// `max_travel_time * sampling_rate` samples and are stored as `u32`.
	#[must_use]
	pub fn sample_offsets(&self, sampling_rate: f64) -> SampleOffsets {
		let n_stations = self.stations.len();
		let n_channels = 2 * n_stations;
		let n_cells = self.grid.n_cells();

		let mut offsets = Vec::with_capacity(n_cells * n_channels);
		for cell in 0..n_cells {
			let [ix, iy, iz] = self.grid.unflatten(cell);
			for phase in Phase::ALL {
				for station in 0..n_stations {
					let time = self.times[[station, phase.index(), ix, iy, iz]];
					offsets.push((time * sampling_rate).round() as u32);
				}
			}
		}
		let max_offset = offsets.iter().copied().max().unwrap_or(0) as usize;

		SampleOffsets { n_stations, n_channels, offsets, max_offset }
	}
}

/// Per-cell sample shifts. Channel `phase * n_stations + station`.
#[derive(Debug, Clone)]
pub struct SampleOffsets {
	n_stations: usize,
	n_channels: usize,
	offsets: Vec<u32>,
	max_offset: usize,
}

impl SampleOffsets {
	#[must_use]
	pub fn for_cell(&self, cell: usize) -> &[u32] {
		&self.offsets[cell * self.n_channels..(cell + 1) * self.n_channels]
	}

	#[must_use]
	pub const fn n_stations(&self) -> usize {
		self.n_stations
	}

	#[must_use]
	pub const fn n_channels(&self) -> usize {
		self.n_channels
	}

	#[must_use]
	pub const fn max_offset(&self) -> usize {
		self.max_offset
	}

	#[must_use]
	pub const fn channel(&self, station: usize, phase: Phase) -> usize {
		phase.index() * self.n_stations + station
	}
}

fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
	let dx = a[0] - b[0];
	let dy = a[1] - b[1];
	let dz = a[2] - b[2];
	(dx * dx + dy * dy + dz * dz).sqrt()
}

fn station_times(grid: &Grid, station: &Station, phase: Phase, model: &VelocityModel) -> Result<Array3<f64>> {
	let [nx, ny, nz] = grid.cell_count();
	let source = station.xyz(grid);

	match model {
		VelocityModel::Homogeneous { vp, vs } => {
			if !(vp.is_finite() && *vp > 0.0 && vs.is_finite() && *vs > 0.0) {
				return Err(Error::model(format!("homogeneous model needs positive vp and vs, got {vp} and {vs}")));
			}
			let velocity = match phase {
				Phase::P => *vp,
				Phase::S => *vs,
			};
			Ok(Array3::from_shape_fn((nx, ny, nz), |(ix, iy, iz)| {
				distance(grid.node_xyz([ix, iy, iz]), source) / velocity
			}))
		},
		VelocityModel::FastMarching1d(layers) => {
			if !grid.contains(source) {
				return Err(Error::geometry(format!(
					"station {} lies outside the grid; fast marching needs it inside",
					station.name
				)));
			}
			let slowness: Vec<f64> = (0..grid.n_cells())
				.map(|cell| 1.0 / layers.velocity_at(phase, grid.node_xyz(grid.unflatten(cell))[2]))
				.collect();
			let origin = grid.origin();
			let size = grid.cell_size();
			let position = [
				(source[0] - origin[0]) / size[0],
				(source[1] - origin[1]) / size[1],
				(source[2] - origin[2]) / size[2],
			];

			let solver = FastMarching::new(grid.cell_count(), size);
			let seeds = solver.seeds_around(position, &slowness);
			let times = solver
				.solve(&slowness, &seeds)
				.map_err(|e| Error::model(format!("station {} ({phase}): {e}", station.name)))?;
			Array3::from_shape_vec((nx, ny, nz), times).map_err(|e| Error::model(e.to_string()))
		},
		VelocityModel::Sweep1d { model: layers, spacing } => sweep_times(grid, station, phase, layers, *spacing),
		VelocityModel::External(_) => Err(Error::model("external travel times are not computed per station")),
	}
}

/// Solves a (horizontal distance, depth) slice through the station and
/// interpolates it onto every grid node.
fn sweep_times(grid: &Grid, station: &Station, phase: Phase, layers: &LayeredModel, spacing: f64) -> Result<Array3<f64>> {
	if !(spacing.is_finite() && spacing > 0.0) {
		return Err(Error::model(format!("sweep spacing must be positive, got {spacing}")));
	}
	let [nx, ny, nz] = grid.cell_count();
	let source = station.xyz(grid);
	let lower = grid.origin();
	let upper = grid.upper_right_xyz();

	let mut max_distance: f64 = 0.0;
	for x in [lower[0], upper[0]] {
		for y in [lower[1], upper[1]] {
			max_distance = max_distance.max((x - source[0]).hypot(y - source[1]));
		}
	}
	let top = lower[2].min(source[2]);
	let bottom = upper[2].max(source[2]);

	let n_distance = ((max_distance / spacing).ceil() as usize + 2).max(2);
	let n_depth = (((bottom - top) / spacing).ceil() as usize + 2).max(2);

	let slowness: Vec<f64> = (0..n_distance * n_depth)
		.map(|flat| {
			let depth = ((flat % n_depth) as f64).mul_add(spacing, top);
			1.0 / layers.velocity_at(phase, depth)
		})
		.collect();

	let solver = FastMarching::new([n_distance, 1, n_depth], [spacing; 3]);
	let seeds = solver.seeds_around([0.0, 0.0, (source[2] - top) / spacing], &slowness);
	let slice = solver
		.solve(&slowness, &seeds)
		.map_err(|e| Error::model(format!("station {} ({phase}): {e}", station.name)))?;

	let at = |ir: usize, iz: usize| slice[ir * n_depth + iz];
	Ok(Array3::from_shape_fn((nx, ny, nz), |(ix, iy, iz)| {
		let node = grid.node_xyz([ix, iy, iz]);
		let r = ((node[0] - source[0]).hypot(node[1] - source[1]) / spacing).clamp(0.0, (n_distance - 1) as f64);
		let z = ((node[2] - top) / spacing).clamp(0.0, (n_depth - 1) as f64);

		let r0 = (r.floor() as usize).min(n_distance - 2);
		let z0 = (z.floor() as usize).min(n_depth - 2);
		let fr = r - r0 as f64;
		let fz = z - z0 as f64;

		let near = at(r0, z0).mul_add(1.0 - fz, at(r0, z0 + 1) * fz);
		let far = at(r0 + 1, z0).mul_add(1.0 - fz, at(r0 + 1, z0 + 1) * fz);
		near.mul_add(1.0 - fr, far * fr)
	}))
}

fn external_times(grid: &Grid, n_stations: usize, external: &ExternalTimes) -> Result<Vec<[Array3<f64>; 2]>> {
	if external.p.len() != n_stations || external.s.len() != n_stations {
		return Err(Error::geometry(format!(
			"external travel times cover {} P and {} S stations, expected {n_stations}",
			external.p.len(),
			external.s.len()
		)));
	}
	let counts = grid.cell_count();
	let mut out = Vec::with_capacity(n_stations);
	for (index, (p, s)) in external.p.iter().zip(&external.s).enumerate() {
		for (phase, array) in [(Phase::P, p), (Phase::S, s)] {
			if array.shape() != counts {
				return Err(Error::geometry(format!(
					"external {phase} times for station {index} have shape {:?}, grid has {counts:?}",
					array.shape()
				)));
			}
		}
		out.push([p.clone(), s.clone()]);
	}
	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::grid::{GeoPoint, Projection};

	fn grid() -> Grid {
		Grid::new(
			GeoPoint::new(0.0, 0.0, 0.0),
			GeoPoint::new(4000.0, 3000.0, 2000.0),
			[500.0, 500.0, 500.0],
			Projection::Cartesian,
		)
		.unwrap()
	}

	fn stations() -> Vec<Station> {
		vec![
			Station::new("ST01", 0.0, 0.0, 0.0),
			Station::new("ST02", 4000.0, 500.0, 100.0),
			Station::new("ST03", 2000.0, 3000.0, -200.0),
		]
	}

	#[test]
	fn test_homogeneous_times_are_distance_over_velocity() {
		let grid = grid();
		let stations = stations();
		let table =
			TravelTimeTable::build(grid.clone(), stations.clone(), &VelocityModel::Homogeneous { vp: 5000.0, vs: 2900.0 })
				.unwrap();

		for (index, station) in stations.iter().enumerate() {
			let source = station.xyz(&grid);
			for cell in 0..grid.n_cells() {
				let node_index = grid.unflatten(cell);
				let node = grid.node_xyz(node_index);
				let dx = node[0] - source[0];
				let dy = node[1] - source[1];
				let dz = node[2] - source[2];
				let d = (dx * dx + dy * dy + dz * dz).sqrt();
				assert_eq!(table.travel_time(index, Phase::P, node_index), d / 5000.0);
				assert_eq!(table.travel_time(index, Phase::S, node_index), d / 2900.0);
			}
		}
	}

	#[test]
	fn test_homogeneous_rejects_non_positive_velocity() {
		let result = TravelTimeTable::build(grid(), stations(), &VelocityModel::Homogeneous { vp: 5000.0, vs: 0.0 });
		assert!(matches!(result, Err(Error::Model(_))));
	}

	#[test]
	fn test_fast_marching_matches_homogeneous_closely() {
		let grid = grid();
		let stations = vec![Station::new("IN01", 2000.0, 1500.0, -1000.0)];
		let layers = LayeredModel::new(vec![Layer { depth: 0.0, vp: 5000.0, vs: 2900.0 }]).unwrap();
		let marched = TravelTimeTable::build(grid.clone(), stations.clone(), &VelocityModel::FastMarching1d(layers)).unwrap();
		let straight =
			TravelTimeTable::build(grid.clone(), stations, &VelocityModel::Homogeneous { vp: 5000.0, vs: 2900.0 }).unwrap();

		for cell in 0..grid.n_cells() {
			let index = grid.unflatten(cell);
			let a = marched.travel_time(0, Phase::P, index);
			let b = straight.travel_time(0, Phase::P, index);
			assert!(a >= b * 0.97 - 1e-9, "fast marching undercut straight ray at {index:?}");
			assert!(a <= b * 1.15 + 1e-9, "fast marching too slow at {index:?}: {a} vs {b}");
		}
	}

	#[test]
	fn test_fast_marching_rejects_station_outside_grid() {
		let layers = LayeredModel::new(vec![Layer { depth: 0.0, vp: 5000.0, vs: 2900.0 }]).unwrap();
		let result = TravelTimeTable::build(grid(), stations(), &VelocityModel::FastMarching1d(layers));
		assert!(matches!(result, Err(Error::Geometry(_))));
	}

	#[test]
	fn test_sweep_handles_station_outside_grid() {
		let grid = grid();
		let stations = vec![Station::new("OUT1", -3000.0, -2000.0, 500.0)];
		let layers = LayeredModel::new(vec![
			Layer { depth: 0.0, vp: 4000.0, vs: 2300.0 },
			Layer { depth: 1000.0, vp: 6000.0, vs: 3500.0 },
		])
		.unwrap();
		let table =
			TravelTimeTable::build(grid.clone(), stations, &VelocityModel::Sweep1d { model: layers, spacing: 100.0 }).unwrap();

		assert!(table.times().iter().all(|t| t.is_finite() && *t > 0.0));
		let near = table.travel_time(0, Phase::P, [0, 0, 0]);
		let far = table.travel_time(0, Phase::P, [8, 6, 0]);
		assert!(far > near);
		assert!(table.travel_time(0, Phase::S, [0, 0, 0]) > near);
	}

	#[test]
	fn test_external_shape_mismatch_is_geometry_error() {
		let grid = grid();
		let external = ExternalTimes { p: vec![Array3::zeros((2, 2, 2))], s: vec![Array3::zeros((2, 2, 2))] };
		let result = TravelTimeTable::build(grid, vec![Station::new("ST01", 0.0, 0.0, 0.0)], &VelocityModel::External(external));
		assert!(matches!(result, Err(Error::Geometry(_))));
	}

	#[test]
	fn test_external_negative_time_is_model_error() {
		let grid = grid();
		let [nx, ny, nz] = grid.cell_count();
		let mut p = Array3::from_elem((nx, ny, nz), 1.0);
		p[[1, 1, 1]] = -0.5;
		let external = ExternalTimes { p: vec![p], s: vec![Array3::from_elem((nx, ny, nz), 2.0)] };
		let result = TravelTimeTable::build(grid, vec![Station::new("ST01", 0.0, 0.0, 0.0)], &VelocityModel::External(external));
		assert!(matches!(result, Err(Error::Model(_))));
	}

	#[test]
	fn test_decimate_subsamples_times() {
		let grid = grid();
		let table =
			TravelTimeTable::build(grid.clone(), stations(), &VelocityModel::Homogeneous { vp: 5000.0, vs: 2900.0 }).unwrap();
		let coarse = table.decimate([2, 2, 2]).unwrap();
		let (coarse_grid, first) = grid.decimate([2, 2, 2]).unwrap();

		assert_eq!(coarse.grid(), &coarse_grid);
		for cell in 0..coarse_grid.n_cells() {
			let [ix, iy, iz] = coarse_grid.unflatten(cell);
			let fine = [first[0] + 2 * ix, first[1] + 2 * iy, first[2] + 2 * iz];
			for station in 0..3 {
				assert_eq!(coarse.travel_time(station, Phase::S, [ix, iy, iz]), table.travel_time(station, Phase::S, fine));
			}
		}
	}

	#[test]
	fn test_sample_offsets_layout() {
		let grid = grid();
		let table = TravelTimeTable::build(grid.clone(), stations(), &VelocityModel::Homogeneous { vp: 5000.0, vs: 2500.0 })
			.unwrap();
		let offsets = table.sample_offsets(100.0);
		assert_eq!(offsets.n_channels(), 6);

		let cell = grid.flat_index([3, 2, 1]);
		let shifts = offsets.for_cell(cell);
		let expected = (table.travel_time(1, Phase::S, [3, 2, 1]) * 100.0).round() as u32;
		assert_eq!(shifts[offsets.channel(1, Phase::S)], expected);
		assert_eq!(offsets.max_offset(), (table.max_travel_time() * 100.0).round() as usize);
		assert_eq!(std::mem::size_of_val(shifts), 6 * std::mem::size_of::<u32>());
	}
}
