use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use backproject::lut::{ExternalTimes, Layer, LayeredModel};
use backproject::{GeoPoint, Grid, LocateConfig, OnsetMethod, Projection, ScanConfig, Station, TriggerConfig, VelocityModel};
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub run: RunConfig,
	pub grid: GridConfig,
	pub velocity: VelocityConfig,
	pub stations: Vec<Station>,
	pub onset: Option<OnsetConfig>,
	pub scan: ScanConfig,
	pub trigger: TriggerConfig,
	pub locate: LocateConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
	pub output_dir: PathBuf,
	/// Travel-time table written by `build-lut` and read by the other stages.
	pub lut: PathBuf,
	/// Onset functions as JSON. Mutually exclusive with `waveforms`.
	pub onsets: Option<PathBuf>,
	/// Filtered three-component waveforms as JSON; onsets are computed with
	/// the `[onset]` methods.
	pub waveforms: Option<PathBuf>,
	pub start: DateTime<Utc>,
	pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridConfig {
	#[serde(default = "default_projection")]
	pub projection: Projection,
	pub lower_left: GeoPoint,
	pub upper_right: GeoPoint,
	pub cell_size: [f64; 3],
}

const fn default_projection() -> Projection {
	Projection::Cartesian
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VelocityConfig {
	Homogeneous { vp: f64, vs: f64 },
	FastMarching { layers: Vec<Layer> },
	Sweep { layers: Vec<Layer>, spacing: f64 },
	/// JSON file holding `p` and `s` arrays per station.
	External { path: PathBuf },
}

#[derive(Debug, Clone, Deserialize)]
pub struct OnsetConfig {
	pub p: OnsetMethod,
	pub s: OnsetMethod,
}

impl Config {
	pub fn load(path: &str) -> Result<Self> {
		let content = fs::read_to_string(path).with_context(|| format!("Failed to read config file: {path}"))?;

		let config: Self = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

		config.validate()?;

		Ok(config)
	}

	fn validate(&self) -> Result<()> {
		if self.run.end <= self.run.start {
			anyhow::bail!("run.end must be after run.start");
		}

		if self.stations.is_empty() {
			anyhow::bail!("at least one [[stations]] entry is required");
		}

		match (&self.run.onsets, &self.run.waveforms) {
			(Some(_), Some(_)) => anyhow::bail!("set only one of run.onsets and run.waveforms"),
			(None, Some(_)) if self.onset.is_none() => anyhow::bail!("run.waveforms requires an [onset] section"),
			_ => {},
		}

		if let Some(onset) = &self.onset {
			onset.p.validate().context("invalid onset.p")?;
			onset.s.validate().context("invalid onset.s")?;
		}

		self.scan.validate().context("invalid [scan] section")?;
		self.trigger.validate().context("invalid [trigger] section")?;
		self.locate.validate().context("invalid [locate] section")?;

		Ok(())
	}

	pub fn grid(&self) -> Result<Grid> {
		let grid = &self.grid;
		Grid::new(grid.lower_left, grid.upper_right, grid.cell_size, grid.projection).context("invalid [grid] section")
	}

	pub fn velocity_model(&self) -> Result<VelocityModel> {
		Ok(match &self.velocity {
			VelocityConfig::Homogeneous { vp, vs } => VelocityModel::Homogeneous { vp: *vp, vs: *vs },
			VelocityConfig::FastMarching { layers } => VelocityModel::FastMarching1d(LayeredModel::new(layers.clone())?),
			VelocityConfig::Sweep { layers, spacing } => {
				VelocityModel::Sweep1d { model: LayeredModel::new(layers.clone())?, spacing: *spacing }
			},
			VelocityConfig::External { path } => {
				let content =
					fs::read(path).with_context(|| format!("Failed to read travel times: {}", path.display()))?;
				let times: ExternalTimes = serde_json::from_slice(&content)
					.with_context(|| format!("Failed to parse travel times: {}", path.display()))?;
				VelocityModel::External(times)
			},
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE: &str = r#"
		[run]
		output_dir = "out"
		lut = "out/lut.json"
		onsets = "data/onsets.json"
		start = "2024-06-01T00:00:00Z"
		end = "2024-06-01T01:00:00Z"

		[grid]
		lower_left = { longitude = 0.0, latitude = 0.0, depth = 0.0 }
		upper_right = { longitude = 4000.0, latitude = 4000.0, depth = 3000.0 }
		cell_size = [500.0, 500.0, 500.0]

		[velocity]
		type = "homogeneous"
		vp = 5000.0
		vs = 2900.0

		[[stations]]
		name = "ST01"
		longitude = 0.0
		latitude = 0.0
		elevation = 0.0

		[scan]
		sampling_rate = 100.0
		time_step = 0.05
		low_availability = "flag"

		[trigger]
		detection_threshold = 2.5
		marginal_window = 0.3
		minimum_repeat = 0.5

		[locate]
		marginal_window = 0.3

		[locate.pick]
		min_snr = 2.0
	"#;

	#[test]
	fn test_sample_config_parses_and_validates() {
		let config: Config = toml::from_str(SAMPLE).unwrap();
		config.validate().unwrap();
		assert_eq!(config.stations.len(), 1);
		assert!((config.locate.pick.min_snr - 2.0).abs() < f64::EPSILON);
		assert_eq!(config.grid().unwrap().cell_count(), [9, 9, 7]);
		assert!(matches!(config.velocity_model().unwrap(), VelocityModel::Homogeneous { .. }));
	}

	#[test]
	fn test_missing_low_availability_policy_is_rejected() {
		let without = SAMPLE.replace("low_availability = \"flag\"", "");
		assert!(toml::from_str::<Config>(&without).is_err());
	}

	#[test]
	fn test_waveforms_need_onset_methods() {
		let mut config: Config = toml::from_str(SAMPLE).unwrap();
		config.run.onsets = None;
		config.run.waveforms = Some(PathBuf::from("data/waveforms.json"));
		assert!(config.validate().is_err());
	}
}
