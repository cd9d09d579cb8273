use serde::{Deserialize, Serialize};

use crate::grid::{GeoPoint, Grid};

/// A recording station. Elevation is metres above sea level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Station {
	pub name: String,
	pub longitude: f64,
	pub latitude: f64,
	pub elevation: f64,
}

impl Station {
	#[must_use]
	pub fn new(name: impl Into<String>, longitude: f64, latitude: f64, elevation: f64) -> Self {
		Self { name: name.into(), longitude, latitude, elevation }
	}

	#[must_use]
	pub const fn location(&self) -> GeoPoint {
		GeoPoint { longitude: self.longitude, latitude: self.latitude, depth: -self.elevation }
	}

	/// Cartesian position in the grid's frame.
	#[must_use]
	pub fn xyz(&self, grid: &Grid) -> [f64; 3] {
		grid.to_xyz(self.location())
	}
}
