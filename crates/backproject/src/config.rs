//! Immutable run parameters for the scan, trigger and locate stages.
//!
//! Each struct is deserialised once per run, validated, and then passed by
//! reference into the stage that owns it.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Tolerance when checking that a duration is a whole number of samples.
const SAMPLE_TOLERANCE: f64 = 1e-6;

/// How travel-time-shifted onsets are combined in each cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StackMode {
	/// Mean of the contributing channels.
	#[default]
	Sum,
	/// Geometric mean of the contributing channels.
	Product,
}

/// What to do with a step whose argmax cell has fewer than `min_stations`
/// contributing stations. Either way the record is kept and flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LowAvailabilityPolicy {
	Flag,
	/// Flag and zero the coalescence values.
	Suppress,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
	/// Onset sampling rate in Hz; onset sources must match it.
	pub sampling_rate: f64,
	/// Stride between scanned origin times, in seconds.
	pub time_step: f64,
	#[serde(default)]
	pub stack_mode: StackMode,
	#[serde(default = "default_min_stations")]
	pub min_stations: usize,
	pub low_availability: LowAvailabilityPolicy,
	#[serde(default = "default_decimation")]
	pub decimation: [usize; 3],
	/// Onset coverage required before the first origin time, in seconds.
	#[serde(default)]
	pub pre_pad: f64,
	/// Onset coverage required after the last origin time; defaults to
	/// 1.05 times the largest travel time.
	#[serde(default)]
	pub post_pad: Option<f64>,
	#[serde(default = "default_batch_size")]
	pub batch_size: usize,
}

const fn default_min_stations() -> usize {
	1
}

const fn default_decimation() -> [usize; 3] {
	[1, 1, 1]
}

const fn default_batch_size() -> usize {
	256
}

impl ScanConfig {
	#[must_use]
	pub const fn new(sampling_rate: f64, time_step: f64, low_availability: LowAvailabilityPolicy) -> Self {
		Self {
			sampling_rate,
			time_step,
			stack_mode: StackMode::Sum,
			min_stations: default_min_stations(),
			low_availability,
			decimation: default_decimation(),
			pre_pad: 0.0,
			post_pad: None,
			batch_size: default_batch_size(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
			return Err(Error::config(format!("sampling_rate must be positive, got {}", self.sampling_rate)));
		}
		if !(self.time_step.is_finite() && self.time_step > 0.0) {
			return Err(Error::config(format!("time_step must be positive, got {}", self.time_step)));
		}
		let samples = self.time_step * self.sampling_rate;
		if samples < 1.0 - SAMPLE_TOLERANCE || (samples - samples.round()).abs() > SAMPLE_TOLERANCE {
			return Err(Error::config(format!(
				"time_step {} s is not a whole number of samples at {} Hz",
				self.time_step, self.sampling_rate
			)));
		}
		if self.decimation.contains(&0) {
			return Err(Error::config(format!("decimation factors must be at least 1, got {:?}", self.decimation)));
		}
		if !(self.pre_pad.is_finite() && self.pre_pad >= 0.0) {
			return Err(Error::config(format!("pre_pad must be non-negative, got {}", self.pre_pad)));
		}
		if let Some(post_pad) = self.post_pad
			&& !(post_pad.is_finite() && post_pad >= 0.0)
		{
			return Err(Error::config(format!("post_pad must be non-negative, got {post_pad}")));
		}
		if self.batch_size == 0 {
			return Err(Error::config("batch_size must be at least 1"));
		}
		Ok(())
	}

	/// Time step expressed in samples.
	#[must_use]
	pub fn step_samples(&self) -> i64 {
		(self.time_step * self.sampling_rate).round() as i64
	}

	#[must_use]
	pub fn post_pad_or(&self, max_travel_time: f64) -> f64 {
		self.post_pad.unwrap_or(1.05 * max_travel_time)
	}
}

/// Normalisation applied to the coalescence series before thresholding.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Normalisation {
	#[default]
	None,
	/// Use the grid-normalised value (max over mean of the volume).
	Grid,
	/// Divide by the median coalescence over the trailing `window` seconds.
	TrailingMedian { window: f64 },
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriggerConfig {
	pub detection_threshold: f64,
	/// Seconds.
	pub marginal_window: f64,
	/// Seconds; must be at least `marginal_window`.
	pub minimum_repeat: f64,
	#[serde(default)]
	pub normalisation: Normalisation,
	/// Margin the series should extend beyond the trigger range, in seconds.
	#[serde(default)]
	pub pad: f64,
}

impl TriggerConfig {
	pub fn validate(&self) -> Result<()> {
		if !self.detection_threshold.is_finite() {
			return Err(Error::config("detection_threshold must be finite"));
		}
		if !(self.marginal_window.is_finite() && self.marginal_window >= 0.0) {
			return Err(Error::config(format!("marginal_window must be non-negative, got {}", self.marginal_window)));
		}
		if !self.minimum_repeat.is_finite() || self.minimum_repeat < self.marginal_window {
			return Err(Error::config(format!(
				"minimum_repeat ({}) must be at least marginal_window ({})",
				self.minimum_repeat, self.marginal_window
			)));
		}
		if let Normalisation::TrailingMedian { window } = self.normalisation
			&& !(window.is_finite() && window > 0.0)
		{
			return Err(Error::config(format!("trailing median window must be positive, got {window}")));
		}
		if !(self.pad.is_finite() && self.pad >= 0.0) {
			return Err(Error::config(format!("pad must be non-negative, got {}", self.pad)));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickModel {
	#[default]
	Gaussian,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PickConfig {
	#[serde(default)]
	pub model: PickModel,
	/// Fraction (0..=1) giving the percentile of out-of-window onset used as
	/// the noise threshold.
	#[serde(default = "default_pick_threshold")]
	pub pick_threshold: f64,
	/// Fraction of the travel time added to the marginal window when sizing
	/// the pick window.
	#[serde(default = "default_percent_tt")]
	pub percent_tt: f64,
	#[serde(default = "default_min_snr")]
	pub min_snr: f64,
}

const fn default_pick_threshold() -> f64 {
	1.0
}

const fn default_percent_tt() -> f64 {
	0.1
}

const fn default_min_snr() -> f64 {
	1.5
}

impl Default for PickConfig {
	fn default() -> Self {
		Self {
			model: PickModel::Gaussian,
			pick_threshold: default_pick_threshold(),
			percent_tt: default_percent_tt(),
			min_snr: default_min_snr(),
		}
	}
}

impl PickConfig {
	pub fn validate(&self) -> Result<()> {
		if !(0.0..=1.0).contains(&self.pick_threshold) {
			return Err(Error::config(format!("pick_threshold must lie in [0, 1], got {}", self.pick_threshold)));
		}
		if !(self.percent_tt.is_finite() && self.percent_tt >= 0.0) {
			return Err(Error::config(format!("percent_tt must be non-negative, got {}", self.percent_tt)));
		}
		if !(self.min_snr.is_finite() && self.min_snr >= 0.0) {
			return Err(Error::config(format!("min_snr must be non-negative, got {}", self.min_snr)));
		}
		Ok(())
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocateConfig {
	/// Seconds.
	pub marginal_window: f64,
	#[serde(default = "default_spline_window")]
	pub spline_window: usize,
	#[serde(default = "default_spline_upscale")]
	pub spline_upscale: usize,
	#[serde(default = "default_gaussian_window")]
	pub gaussian_window: usize,
	/// Gaussian smoothing width in cells applied before the local fit.
	#[serde(default = "default_smoothing_sigma")]
	pub smoothing_sigma: f64,
	#[serde(default = "default_covariance_threshold")]
	pub covariance_threshold: f64,
	#[serde(default)]
	pub pick: PickConfig,
}

const fn default_spline_window() -> usize {
	5
}

const fn default_spline_upscale() -> usize {
	10
}

const fn default_gaussian_window() -> usize {
	7
}

const fn default_smoothing_sigma() -> f64 {
	0.8
}

const fn default_covariance_threshold() -> f64 {
	0.88
}

impl LocateConfig {
	#[must_use]
	pub fn new(marginal_window: f64) -> Self {
		Self {
			marginal_window,
			spline_window: default_spline_window(),
			spline_upscale: default_spline_upscale(),
			gaussian_window: default_gaussian_window(),
			smoothing_sigma: default_smoothing_sigma(),
			covariance_threshold: default_covariance_threshold(),
			pick: PickConfig::default(),
		}
	}

	pub fn validate(&self) -> Result<()> {
		if !(self.marginal_window.is_finite() && self.marginal_window >= 0.0) {
			return Err(Error::config(format!("marginal_window must be non-negative, got {}", self.marginal_window)));
		}
		if self.spline_window < 3 || self.spline_window % 2 == 0 {
			return Err(Error::config(format!("spline_window must be odd and at least 3, got {}", self.spline_window)));
		}
		if self.spline_upscale == 0 {
			return Err(Error::config("spline_upscale must be at least 1"));
		}
		if self.gaussian_window < 3 || self.gaussian_window % 2 == 0 {
			return Err(Error::config(format!(
				"gaussian_window must be odd and at least 3, got {}",
				self.gaussian_window
			)));
		}
		if !(self.smoothing_sigma.is_finite() && self.smoothing_sigma >= 0.0) {
			return Err(Error::config(format!("smoothing_sigma must be non-negative, got {}", self.smoothing_sigma)));
		}
		if !(self.covariance_threshold > 0.0 && self.covariance_threshold < 1.0) {
			return Err(Error::config(format!(
				"covariance_threshold must lie in (0, 1), got {}",
				self.covariance_threshold
			)));
		}
		self.pick.validate()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_scan_config_requires_policy() {
		let missing: std::result::Result<ScanConfig, _> = from_json(r#"{"sampling_rate": 100.0, "time_step": 0.1}"#);
		assert!(missing.is_err());

		let config: ScanConfig =
			from_json(r#"{"sampling_rate": 100.0, "time_step": 0.1, "low_availability": "suppress"}"#).unwrap();
		assert_eq!(config.low_availability, LowAvailabilityPolicy::Suppress);
		assert_eq!(config.stack_mode, StackMode::Sum);
		assert_eq!(config.decimation, [1, 1, 1]);
		assert!(config.validate().is_ok());
		assert_eq!(config.step_samples(), 10);
	}

	fn from_json<T: serde::de::DeserializeOwned>(json: &str) -> serde_json::Result<T> {
		serde_json::from_str(json)
	}

	#[test]
	fn test_time_step_must_be_whole_samples() {
		let mut config = ScanConfig::new(100.0, 0.015, LowAvailabilityPolicy::Flag);
		assert!(matches!(config.validate(), Err(Error::Config(_))));
		config.time_step = 0.0;
		assert!(matches!(config.validate(), Err(Error::Config(_))));
		config.time_step = 0.02;
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_post_pad_defaults_to_travel_time_margin() {
		let config = ScanConfig::new(100.0, 0.1, LowAvailabilityPolicy::Flag);
		assert!((config.post_pad_or(10.0) - 10.5).abs() < 1e-12);
	}

	#[test]
	fn test_minimum_repeat_must_cover_marginal_window() {
		let config = TriggerConfig {
			detection_threshold: 2.0,
			marginal_window: 2.0,
			minimum_repeat: 1.0,
			normalisation: Normalisation::None,
			pad: 0.0,
		};
		assert!(matches!(config.validate(), Err(Error::Config(_))));
	}

	#[test]
	fn test_locate_defaults() {
		let config = LocateConfig::new(1.0);
		assert_eq!(config.spline_window, 5);
		assert_eq!(config.spline_upscale, 10);
		assert_eq!(config.gaussian_window, 7);
		assert!(config.validate().is_ok());
	}
}
