//! Cartesian coalescence volume and its geographic projection.
//!
//! Axes are x east, y north and z depth (metres, positive down). Node
//! `(0, 0, 0)` sits on the lower-left, shallowest corner. Flat cell indices
//! are C-ordered with z varying fastest.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Metres per degree of latitude on the simple flat-earth projection.
const METRES_PER_DEGREE: f64 = 111_111.0;

/// Tolerance used when deciding whether a cell size divides an extent exactly.
const DIVISION_TOLERANCE: f64 = 1e-9;

/// A geographic location: longitude/latitude in degrees, depth in metres
/// (positive down).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
	pub longitude: f64,
	pub latitude: f64,
	pub depth: f64,
}

impl GeoPoint {
	#[must_use]
	pub const fn new(longitude: f64, latitude: f64, depth: f64) -> Self {
		Self { longitude, latitude, depth }
	}
}

/// Geographic <-> Cartesian projection pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Projection {
	/// Horizontal coordinates are already metres; longitude maps to x and
	/// latitude to y unchanged.
	Cartesian,
	/// Flat-earth tangent plane about `(origin_lon, origin_lat)`.
	LocalTangent { origin_lon: f64, origin_lat: f64 },
}

impl Projection {
	#[must_use]
	pub fn forward(&self, longitude: f64, latitude: f64) -> (f64, f64) {
		match *self {
			Self::Cartesian => (longitude, latitude),
			Self::LocalTangent { origin_lon, origin_lat } => {
				let scale = METRES_PER_DEGREE * origin_lat.to_radians().cos();
				((longitude - origin_lon) * scale, (latitude - origin_lat) * METRES_PER_DEGREE)
			},
		}
	}

	#[must_use]
	pub fn inverse(&self, x: f64, y: f64) -> (f64, f64) {
		match *self {
			Self::Cartesian => (x, y),
			Self::LocalTangent { origin_lon, origin_lat } => {
				let scale = METRES_PER_DEGREE * origin_lat.to_radians().cos();
				(origin_lon + x / scale, origin_lat + y / METRES_PER_DEGREE)
			},
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grid {
	projection: Projection,
	origin: [f64; 3],
	cell_count: [usize; 3],
	cell_size: [f64; 3],
}

impl Grid {
	/// Builds a grid spanning `lower_left` to `upper_right`.
	///
	/// The realised upper-right corner is pushed outward until the cell size
	/// divides the extent along every axis, so the requested volume is never
	/// truncated.
	pub fn new(lower_left: GeoPoint, upper_right: GeoPoint, cell_size: [f64; 3], projection: Projection) -> Result<Self> {
		validate_cell_size(cell_size)?;

		let (x0, y0) = projection.forward(lower_left.longitude, lower_left.latitude);
		let (x1, y1) = projection.forward(upper_right.longitude, upper_right.latitude);
		let origin = [x0, y0, lower_left.depth];
		let extent = [x1 - x0, y1 - y0, upper_right.depth - lower_left.depth];

		let mut cell_count = [0; 3];
		for axis in 0..3 {
			if !extent[axis].is_finite() || extent[axis] < 0.0 {
				return Err(Error::config(format!(
					"upper-right corner lies before lower-left corner along axis {axis} (extent {:.3} m)",
					extent[axis]
				)));
			}
			cell_count[axis] = cells_covering(extent[axis], cell_size[axis]) + 1;
		}

		Ok(Self { projection, origin, cell_count, cell_size })
	}

	/// Builds a grid directly from its Cartesian origin and node counts.
	pub fn from_parts(
		projection: Projection,
		origin: [f64; 3],
		cell_count: [usize; 3],
		cell_size: [f64; 3],
	) -> Result<Self> {
		validate_cell_size(cell_size)?;
		if cell_count.contains(&0) {
			return Err(Error::config(format!("cell counts must be positive, got {cell_count:?}")));
		}
		if origin.iter().any(|v| !v.is_finite()) {
			return Err(Error::config("grid origin must be finite"));
		}
		Ok(Self { projection, origin, cell_count, cell_size })
	}

	#[must_use]
	pub const fn projection(&self) -> &Projection {
		&self.projection
	}

	#[must_use]
	pub const fn origin(&self) -> [f64; 3] {
		self.origin
	}

	#[must_use]
	pub const fn cell_count(&self) -> [usize; 3] {
		self.cell_count
	}

	#[must_use]
	pub const fn cell_size(&self) -> [f64; 3] {
		self.cell_size
	}

	#[must_use]
	pub const fn n_cells(&self) -> usize {
		self.cell_count[0] * self.cell_count[1] * self.cell_count[2]
	}

	#[must_use]
	pub const fn flat_index(&self, index: [usize; 3]) -> usize {
		(index[0] * self.cell_count[1] + index[1]) * self.cell_count[2] + index[2]
	}

	#[must_use]
	pub const fn unflatten(&self, flat: usize) -> [usize; 3] {
		let nz = self.cell_count[2];
		let ny = self.cell_count[1];
		[flat / (ny * nz), (flat / nz) % ny, flat % nz]
	}

	/// Cartesian position of a node.
	#[must_use]
	pub fn node_xyz(&self, index: [usize; 3]) -> [f64; 3] {
		self.position_xyz([index[0] as f64, index[1] as f64, index[2] as f64])
	}

	/// Cartesian position of a fractional node index.
	#[must_use]
	pub fn position_xyz(&self, index: [f64; 3]) -> [f64; 3] {
		[
			self.origin[0] + index[0] * self.cell_size[0],
			self.origin[1] + index[1] * self.cell_size[1],
			self.origin[2] + index[2] * self.cell_size[2],
		]
	}

	/// Nearest node to a Cartesian position, clamped onto the grid.
	#[must_use]
	pub fn nearest_cell(&self, xyz: [f64; 3]) -> [usize; 3] {
		let mut index = [0; 3];
		for axis in 0..3 {
			let fractional = ((xyz[axis] - self.origin[axis]) / self.cell_size[axis]).round();
			let last = (self.cell_count[axis] - 1) as f64;
			index[axis] = fractional.clamp(0.0, last) as usize;
		}
		index
	}

	#[must_use]
	pub fn contains(&self, xyz: [f64; 3]) -> bool {
		let upper = self.upper_right_xyz();
		(0..3).all(|axis| xyz[axis] >= self.origin[axis] && xyz[axis] <= upper[axis])
	}

	#[must_use]
	pub fn upper_right_xyz(&self) -> [f64; 3] {
		self.node_xyz([self.cell_count[0] - 1, self.cell_count[1] - 1, self.cell_count[2] - 1])
	}

	#[must_use]
	pub fn lower_left(&self) -> GeoPoint {
		self.to_geographic(self.origin)
	}

	#[must_use]
	pub fn upper_right(&self) -> GeoPoint {
		self.to_geographic(self.upper_right_xyz())
	}

	#[must_use]
	pub fn to_geographic(&self, xyz: [f64; 3]) -> GeoPoint {
		let (longitude, latitude) = self.projection.inverse(xyz[0], xyz[1]);
		GeoPoint { longitude, latitude, depth: xyz[2] }
	}

	#[must_use]
	pub fn to_xyz(&self, point: GeoPoint) -> [f64; 3] {
		let (x, y) = self.projection.forward(point.longitude, point.latitude);
		[x, y, point.depth]
	}

	/// Coarser view keeping every `factors[axis]`-th node, centred in the
	/// original extent. Returns the new grid and the index of the first kept
	/// node along each axis.
	pub fn decimate(&self, factors: [usize; 3]) -> Result<(Self, [usize; 3])> {
		if factors.contains(&0) {
			return Err(Error::config(format!("decimation factors must be at least 1, got {factors:?}")));
		}

		let mut cell_count = [0; 3];
		let mut first = [0; 3];
		let mut cell_size = [0.0; 3];
		for axis in 0..3 {
			let n = self.cell_count[axis];
			let k = factors[axis];
			cell_count[axis] = 1 + (n - 1) / k;
			first[axis] = (n - k * (cell_count[axis] - 1) - 1) / 2;
			cell_size[axis] = self.cell_size[axis] * k as f64;
		}

		let origin = self.node_xyz(first);
		Ok((Self { projection: self.projection, origin, cell_count, cell_size }, first))
	}
}

fn validate_cell_size(cell_size: [f64; 3]) -> Result<()> {
	if cell_size.iter().any(|d| !d.is_finite() || *d <= 0.0) {
		return Err(Error::config(format!("cell size must be positive in every dimension, got {cell_size:?}")));
	}
	Ok(())
}

fn cells_covering(extent: f64, cell: f64) -> usize {
	let ratio = extent / cell;
	if (ratio - ratio.round()).abs() < DIVISION_TOLERANCE { ratio.round() as usize } else { ratio.ceil() as usize }
}
