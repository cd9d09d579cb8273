//! Onset (characteristic) functions and the source the scanner reads them
//! from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lut::Phase;

/// Lower clip applied to `1 + sta/lta` before taking the logarithm.
const RATIO_FLOOR: f64 = 0.8;

/// STA/LTA variant used to turn a filtered waveform into an onset function.
/// Window lengths are seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OnsetMethod {
	/// Short- and long-term windows both trail the sample.
	ClassicStaLta { sta: f64, lta: f64 },
	/// The short-term window leads the sample, the long-term window trails it.
	CentredStaLta { sta: f64, lta: f64 },
}

impl OnsetMethod {
	pub fn validate(&self) -> Result<()> {
		let (Self::ClassicStaLta { sta, lta } | Self::CentredStaLta { sta, lta }) = *self;
		if !(sta.is_finite() && sta > 0.0 && lta.is_finite() && lta > sta) {
			return Err(Error::config(format!("STA/LTA windows need 0 < sta < lta, got sta = {sta}, lta = {lta}")));
		}
		Ok(())
	}

	/// Log-clipped STA/LTA ratio `ln(max(1 + sta/lta, 0.8))`. An all-zero
	/// signal yields an all-zero onset.
	#[must_use]
	pub fn apply(&self, signal: &[f64], sampling_rate: f64) -> Vec<f64> {
		if signal.iter().all(|v| *v == 0.0) {
			return vec![0.0; signal.len()];
		}

		let (Self::ClassicStaLta { sta, lta } | Self::CentredStaLta { sta, lta }) = *self;
		let n_sta = ((sta * sampling_rate).round() as usize).max(1);
		let n_lta = ((lta * sampling_rate).round() as usize).max(1);
		let centred = matches!(self, Self::CentredStaLta { .. });

		let mut cumulative = Vec::with_capacity(signal.len());
		let mut running = 0.0;
		for v in signal {
			running += v * v;
			cumulative.push(running);
		}
		let window = |end: usize, length: usize| {
			if end >= length { cumulative[end] - cumulative[end - length] } else { cumulative[end] }
		};

		let n = signal.len();
		(0..n)
			.map(|i| {
				if i + 1 < n_lta || (centred && i + n_sta >= n) {
					return 0.0;
				}
				let short_end = if centred { i + n_sta } else { i };
				let short = window(short_end, n_sta) / n_sta as f64;
				let long = window(i, n_lta) / n_lta as f64;
				let ratio = if long < f64::MIN_POSITIVE { 0.0 } else { short / long };
				(1.0 + ratio).max(RATIO_FLOOR).ln()
			})
			.collect()
	}
}

/// S-wave onset from the two horizontal component onsets.
#[must_use]
pub fn combine_horizontal(east: &[f64], north: &[f64]) -> Vec<f64> {
	east.iter().zip(north).map(|(e, n)| ((e * e + n * n) / 2.0).sqrt()).collect()
}

/// Read access to regularly sampled onset functions for every station and
/// phase. Implementations are shared between scan workers.
pub trait OnsetSource: Sync {
	fn start_time(&self) -> DateTime<Utc>;

	fn sampling_rate(&self) -> f64;

	fn n_stations(&self) -> usize;

	/// Whole trace for a station and phase, or `None` if the station has no
	/// data at all.
	fn trace(&self, station: usize, phase: Phase) -> Option<&[f64]>;

	/// Sample `index` counted from [`OnsetSource::start_time`]. Indices
	/// outside the trace and non-finite values are gaps.
	fn sample(&self, station: usize, phase: Phase, index: i64) -> Option<f64> {
		let index = usize::try_from(index).ok()?;
		self.trace(station, phase)?.get(index).copied().filter(|v| v.is_finite())
	}

	fn n_samples(&self) -> usize {
		(0..self.n_stations())
			.flat_map(|station| Phase::ALL.map(|phase| self.trace(station, phase).map_or(0, <[f64]>::len)))
			.max()
			.unwrap_or(0)
	}
}

/// Three-component waveform for one station, already filtered and resampled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Waveforms {
	pub z: Vec<f64>,
	pub n: Vec<f64>,
	pub e: Vec<f64>,
}

/// In-memory onset functions, indexed `[station]` per phase. A station with
/// no data is `None`; gaps inside a trace are NaN.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnsetData {
	start_time: DateTime<Utc>,
	sampling_rate: f64,
	p: Vec<Option<Vec<f64>>>,
	s: Vec<Option<Vec<f64>>>,
}

impl OnsetData {
	pub fn new(
		start_time: DateTime<Utc>,
		sampling_rate: f64,
		p: Vec<Option<Vec<f64>>>,
		s: Vec<Option<Vec<f64>>>,
	) -> Result<Self> {
		let data = Self { start_time, sampling_rate, p, s };
		data.validate()?;
		Ok(data)
	}

	/// Builds P onsets from the vertical and S onsets from the combined
	/// horizontal components.
	pub fn from_waveforms(
		start_time: DateTime<Utc>,
		sampling_rate: f64,
		p_method: &OnsetMethod,
		s_method: &OnsetMethod,
		waveforms: &[Option<Waveforms>],
	) -> Result<Self> {
		p_method.validate()?;
		s_method.validate()?;

		let mut p = Vec::with_capacity(waveforms.len());
		let mut s = Vec::with_capacity(waveforms.len());
		for station in waveforms {
			match station {
				Some(w) => {
					p.push(Some(p_method.apply(&w.z, sampling_rate)));
					let east = s_method.apply(&w.e, sampling_rate);
					let north = s_method.apply(&w.n, sampling_rate);
					s.push(Some(combine_horizontal(&east, &north)));
				},
				None => {
					p.push(None);
					s.push(None);
				},
			}
		}
		Self::new(start_time, sampling_rate, p, s)
	}

	pub fn validate(&self) -> Result<()> {
		if !(self.sampling_rate.is_finite() && self.sampling_rate > 0.0) {
			return Err(Error::config(format!("onset sampling rate must be positive, got {}", self.sampling_rate)));
		}
		if self.p.len() != self.s.len() {
			return Err(Error::config(format!(
				"onset data has {} P traces but {} S traces",
				self.p.len(),
				self.s.len()
			)));
		}
		let negative = self.p.iter().chain(&self.s).flatten().flatten().any(|v| *v < 0.0);
		if negative {
			return Err(Error::config("onset functions must be non-negative"));
		}
		Ok(())
	}

	/// Marks samples `[from, to)` of one trace as missing.
	pub fn blank(&mut self, station: usize, phase: Phase, from: usize, to: usize) {
		let traces = match phase {
			Phase::P => &mut self.p,
			Phase::S => &mut self.s,
		};
		if let Some(Some(trace)) = traces.get_mut(station) {
			let to = to.min(trace.len());
			for v in trace.iter_mut().take(to).skip(from) {
				*v = f64::NAN;
			}
		}
	}

	/// Drops every sample of a station.
	pub fn remove_station(&mut self, station: usize) {
		if station < self.p.len() {
			self.p[station] = None;
			self.s[station] = None;
		}
	}
}

impl OnsetSource for OnsetData {
	fn start_time(&self) -> DateTime<Utc> {
		self.start_time
	}

	fn sampling_rate(&self) -> f64 {
		self.sampling_rate
	}

	fn n_stations(&self) -> usize {
		self.p.len()
	}

	fn trace(&self, station: usize, phase: Phase) -> Option<&[f64]> {
		let traces = match phase {
			Phase::P => &self.p,
			Phase::S => &self.s,
		};
		traces.get(station)?.as_deref()
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	fn impulse(n: usize, at: usize) -> Vec<f64> {
		let mut signal: Vec<f64> = (0..n).map(|i| 0.01 * ((i as f64) * 0.7).sin()).collect();
		for v in signal.iter_mut().skip(at).take(20) {
			*v *= 100.0;
		}
		signal
	}

	#[test]
	fn test_zero_signal_gives_zero_onset() {
		let method = OnsetMethod::ClassicStaLta { sta: 0.2, lta: 1.0 };
		assert_eq!(method.apply(&[0.0; 50], 100.0), vec![0.0; 50]);
	}

	#[test]
	fn test_classic_onset_peaks_after_arrival() {
		let method = OnsetMethod::ClassicStaLta { sta: 0.1, lta: 1.0 };
		let onset = method.apply(&impulse(500, 300), 100.0);

		assert!(onset.iter().all(|v| *v >= 0.0));
		assert!(onset[..99].iter().all(|v| *v == 0.0));
		let peak = onset.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)).unwrap().0;
		assert!((300..330).contains(&peak), "peak at {peak}");
	}

	#[test]
	fn test_centred_onset_leads_classic() {
		let signal = impulse(500, 300);
		let classic = OnsetMethod::ClassicStaLta { sta: 0.1, lta: 1.0 }.apply(&signal, 100.0);
		let centred = OnsetMethod::CentredStaLta { sta: 0.1, lta: 1.0 }.apply(&signal, 100.0);

		let first_rise = |onset: &[f64]| onset.iter().position(|v| *v > 1.0).unwrap();
		assert!(first_rise(&centred) < first_rise(&classic));
		assert!(centred[490..].iter().all(|v| *v == 0.0));
	}

	#[test]
	fn test_combine_horizontal() {
		let combined = combine_horizontal(&[3.0, 0.0], &[4.0, 2.0]);
		assert!((combined[0] - 12.5_f64.sqrt()).abs() < 1e-12);
		assert!((combined[1] - 2.0_f64.sqrt()).abs() < 1e-12);
	}

	#[test]
	fn test_gaps_and_missing_stations() {
		let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
		let mut data =
			OnsetData::new(start, 50.0, vec![Some(vec![1.0; 10]), None], vec![Some(vec![2.0; 10]), None]).unwrap();
		data.blank(0, Phase::P, 2, 4);

		assert_eq!(data.sample(0, Phase::P, 1), Some(1.0));
		assert_eq!(data.sample(0, Phase::P, 3), None);
		assert_eq!(data.sample(0, Phase::S, 3), Some(2.0));
		assert_eq!(data.sample(0, Phase::S, -1), None);
		assert_eq!(data.sample(0, Phase::S, 10), None);
		assert_eq!(data.sample(1, Phase::P, 0), None);
		assert_eq!(data.n_samples(), 10);
	}

	#[test]
	fn test_rejects_bad_sampling_rate_and_mismatched_traces() {
		let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
		assert!(matches!(OnsetData::new(start, 0.0, vec![], vec![]), Err(Error::Config(_))));
		assert!(matches!(OnsetData::new(start, 10.0, vec![None], vec![]), Err(Error::Config(_))));
		assert!(matches!(
			OnsetData::new(start, 10.0, vec![Some(vec![-1.0])], vec![Some(vec![0.0])]),
			Err(Error::Config(_))
		));
	}
}
