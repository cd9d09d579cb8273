use ndarray::Array3;
use serde::{Deserialize, Serialize};

use super::Phase;
use crate::error::{Error, Result};

/// One layer of a depth-dependent model. `depth` is the top of the layer in
/// metres (positive down); velocities are m/s.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Layer {
	pub depth: f64,
	pub vp: f64,
	pub vs: f64,
}

/// Layers sorted by depth. The shallowest layer extends upwards without
/// limit and the deepest downwards.
#[derive(Debug, Clone, PartialEq)]
pub struct LayeredModel {
	layers: Vec<Layer>,
}

impl LayeredModel {
	pub fn new(mut layers: Vec<Layer>) -> Result<Self> {
		if layers.is_empty() {
			return Err(Error::model("a layered velocity model needs at least one layer"));
		}
		for layer in &layers {
			if !layer.depth.is_finite() {
				return Err(Error::model("layer depths must be finite"));
			}
			if !(layer.vp.is_finite() && layer.vp > 0.0 && layer.vs.is_finite() && layer.vs > 0.0) {
				return Err(Error::model(format!(
					"layer at {} m must have positive velocities (vp = {}, vs = {})",
					layer.depth, layer.vp, layer.vs
				)));
			}
		}
		layers.sort_by(|a, b| a.depth.total_cmp(&b.depth));
		Ok(Self { layers })
	}

	#[must_use]
	pub fn layers(&self) -> &[Layer] {
		&self.layers
	}

	#[must_use]
	pub fn velocity_at(&self, phase: Phase, depth: f64) -> f64 {
		let layer = self.layers.iter().rev().find(|layer| layer.depth <= depth).unwrap_or(&self.layers[0]);
		match phase {
			Phase::P => layer.vp,
			Phase::S => layer.vs,
		}
	}
}

/// Travel-time arrays computed elsewhere, one `[x, y, z]` array per station
/// and phase, in station order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalTimes {
	pub p: Vec<Array3<f64>>,
	pub s: Vec<Array3<f64>>,
}

/// How the travel-time table is filled.
#[derive(Debug, Clone)]
pub enum VelocityModel {
	/// Straight rays through a uniform medium.
	Homogeneous { vp: f64, vs: f64 },
	/// Fast marching over the full 3-D grid with velocity varying by depth.
	FastMarching1d(LayeredModel),
	/// Fast marching over a (distance, depth) slice per station, swept
	/// across all azimuths by bilinear interpolation.
	Sweep1d { model: LayeredModel, spacing: f64 },
	External(ExternalTimes),
}

impl VelocityModel {
	#[must_use]
	pub const fn name(&self) -> &'static str {
		match self {
			Self::Homogeneous { .. } => "homogeneous",
			Self::FastMarching1d(_) => "fast-marching 1-D",
			Self::Sweep1d { .. } => "eikonal sweep 1-D",
			Self::External(_) => "external",
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn model() -> LayeredModel {
		LayeredModel::new(vec![
			Layer { depth: 5000.0, vp: 6000.0, vs: 3500.0 },
			Layer { depth: 0.0, vp: 4000.0, vs: 2300.0 },
			Layer { depth: 20_000.0, vp: 7000.0, vs: 4000.0 },
		])
		.unwrap()
	}

	#[test]
	fn test_layers_are_sorted() {
		let depths: Vec<f64> = model().layers().iter().map(|l| l.depth).collect();
		assert_eq!(depths, vec![0.0, 5000.0, 20_000.0]);
	}

	#[test]
	fn test_velocity_lookup() {
		let model = model();
		assert_eq!(model.velocity_at(Phase::P, -1500.0), 4000.0);
		assert_eq!(model.velocity_at(Phase::P, 0.0), 4000.0);
		assert_eq!(model.velocity_at(Phase::S, 4999.0), 2300.0);
		assert_eq!(model.velocity_at(Phase::S, 5000.0), 3500.0);
		assert_eq!(model.velocity_at(Phase::P, 90_000.0), 7000.0);
	}

	#[test]
	fn test_rejects_non_positive_velocity() {
		let result = LayeredModel::new(vec![Layer { depth: 0.0, vp: 5000.0, vs: 0.0 }]);
		assert!(matches!(result, Err(Error::Model(_))));
		assert!(matches!(LayeredModel::new(vec![]), Err(Error::Model(_))));
	}
}
