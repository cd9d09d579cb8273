use thiserror::Error;

use crate::lut::Phase;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy of the migration engine.
///
/// `Config` and `Geometry` abort before any heavy work starts. `Model` aborts a
/// travel-time build. `DataGap` and `PickFit` are raised internally and folded
/// into availability flags and sentinel picks, so callers of a scan or locate
/// never see them.
#[derive(Error, Debug)]
pub enum Error {
	#[error("configuration error: {0}")]
	Config(String),

	#[error("geometry error: {0}")]
	Geometry(String),

	#[error("no onset data for station {station} ({phase}) at sample {sample}")]
	DataGap { station: usize, phase: Phase, sample: i64 },

	#[error("travel-time model error: {0}")]
	Model(String),

	#[error("pick fit failed: {0}")]
	PickFit(String),

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("persistence error: {0}")]
	Persist(#[from] serde_json::Error),
}

impl Error {
	pub(crate) fn config(message: impl Into<String>) -> Self {
		Self::Config(message.into())
	}

	pub(crate) fn geometry(message: impl Into<String>) -> Self {
		Self::Geometry(message.into())
	}

	pub(crate) fn model(message: impl Into<String>) -> Self {
		Self::Model(message.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_error_display() {
		let err = Error::config("time_step must be positive");
		assert_eq!(err.to_string(), "configuration error: time_step must be positive");

		let err = Error::DataGap { station: 3, phase: Phase::S, sample: 120 };
		assert_eq!(err.to_string(), "no onset data for station 3 (S) at sample 120");

		let err = Error::model("station ST01: vp must be positive");
		assert_eq!(err.to_string(), "travel-time model error: station ST01: vp must be positive");
	}
}
