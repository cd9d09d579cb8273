//! Phase picking by fitting a Gaussian to the onset function around the
//! modelled arrival.

use nalgebra::{Matrix3, Vector3};

use crate::config::PickConfig;
use crate::error::{Error, Result};
use crate::lut::Phase;

/// Percentile of the onset inside the pick window that the threshold may
/// never fall below.
const WINDOW_PERCENTILE: f64 = 88.0;

/// Modelled arrivals of both phases at one station, as sample positions in
/// the onset segment being picked.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Arrivals {
	pub samples: [i64; 2],
	pub travel_times: [f64; 2],
}

/// Gaussian fitted to an onset pulse.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct GaussianFit {
	/// Centre as a fractional sample position in the segment.
	pub centre: f64,
	/// Standard deviation in seconds.
	pub sigma: f64,
	pub amplitude: f64,
	pub threshold: f64,
}

impl GaussianFit {
	pub(crate) fn snr(&self) -> f64 {
		self.amplitude / self.threshold
	}
}

/// Pick window of each phase: the narrower of half the S-P time and the
/// marginal window grown by a fraction of the travel time.
fn windows(arrivals: &Arrivals, len: usize, sampling_rate: f64, marginal_window: f64, config: &PickConfig) -> [(usize, usize); 2] {
	let half = ((arrivals.samples[1] - arrivals.samples[0]) / 2).max(1);
	[0, 1].map(|i| {
		let width = ((marginal_window + config.percent_tt * arrivals.travel_times[i]) * sampling_rate) as i64;
		let half = half.min(width);
		let lo = (arrivals.samples[i] - half).clamp(0, len as i64) as usize;
		let hi = (arrivals.samples[i] + half + 1).clamp(0, len as i64) as usize;
		(lo, hi)
	})
}

/// Linear-interpolation percentile, `p` in `[0, 100]`.
pub(crate) fn percentile(values: &[f64], p: f64) -> Option<f64> {
	let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
	if sorted.is_empty() {
		return None;
	}
	sorted.sort_by(f64::total_cmp);
	let rank = p.clamp(0.0, 100.0) / 100.0 * (sorted.len() - 1) as f64;
	let lo = rank.floor() as usize;
	let hi = (lo + 1).min(sorted.len() - 1);
	Some((sorted[hi] - sorted[lo]).mul_add(rank - lo as f64, sorted[lo]))
}

/// Fits a Gaussian to `onset` around the modelled arrival of `phase`.
///
/// Fails with [`Error::PickFit`] when the window is empty, nothing in it
/// clears the threshold, the log-parabola is not concave, its centre leaves
/// the fitted run, or the signal-to-noise ratio is below `min_snr`.
pub(crate) fn gaussian_pick(
	onset: &[f64],
	sampling_rate: f64,
	arrivals: &Arrivals,
	phase: Phase,
	marginal_window: f64,
	config: &PickConfig,
) -> Result<GaussianFit> {
	let windows = windows(arrivals, onset.len(), sampling_rate, marginal_window, config);
	let (lo, hi) = windows[phase.index()];
	if lo >= hi {
		return Err(Error::PickFit(format!("{phase} window lies outside the onset data")));
	}

	let noise: Vec<f64> = onset
		.iter()
		.enumerate()
		.filter(|(i, _)| !windows.iter().any(|(a, b)| (*a..*b).contains(i)))
		.map(|(_, v)| *v)
		.collect();
	let window = &onset[lo..hi];
	let inside = percentile(window, WINDOW_PERCENTILE).ok_or_else(|| Error::PickFit(format!("{phase} window has no data")))?;
	let threshold = percentile(&noise, config.pick_threshold * 100.0).map_or(inside, |n| n.max(inside));
	if threshold <= 0.0 {
		return Err(Error::PickFit(format!("{phase} threshold is not positive")));
	}

	let mut peak = lo;
	for i in lo..hi {
		if onset[i].is_finite() && (!onset[peak].is_finite() || onset[i] > onset[peak]) {
			peak = i;
		}
	}
	if onset[peak].is_nan() || onset[peak] <= threshold {
		return Err(Error::PickFit(format!("{phase} onset never exceeds threshold {threshold:.4}")));
	}

	let mut first = peak;
	while first > lo && onset[first - 1] > threshold {
		first -= 1;
	}
	let mut last = peak;
	while last + 1 < hi && onset[last + 1] > threshold {
		last += 1;
	}
	let first = first.saturating_sub(1);
	let last = (last + 1).min(onset.len() - 1);

	let (c0, c1, c2) = fit_log_parabola(onset, first, last, peak)?;
	let offset = -c1 / (2.0 * c2);
	let centre = peak as f64 + offset;
	if centre < first as f64 || centre > last as f64 {
		return Err(Error::PickFit(format!("{phase} fitted centre leaves the onset pulse")));
	}

	let fit = GaussianFit {
		centre,
		sigma: (-1.0 / (2.0 * c2)).sqrt() / sampling_rate,
		amplitude: (c0 - c1 * c1 / (4.0 * c2)).exp(),
		threshold,
	};
	if fit.snr() < config.min_snr {
		return Err(Error::PickFit(format!("{phase} SNR {:.2} below {}", fit.snr(), config.min_snr)));
	}
	Ok(fit)
}

/// Least-squares `ln(v) = c0 + c1 x + c2 x^2` over the positive samples in
/// `[first, last]`, with `x` counted from `peak`.
fn fit_log_parabola(onset: &[f64], first: usize, last: usize, peak: usize) -> Result<(f64, f64, f64)> {
	let mut normal = Matrix3::zeros();
	let mut rhs = Vector3::zeros();
	let mut count = 0;
	for (i, &value) in onset.iter().enumerate().take(last + 1).skip(first) {
		if value.is_nan() || value <= 0.0 {
			continue;
		}
		let x = i as f64 - peak as f64;
		let basis = Vector3::new(1.0, x, x * x);
		normal += basis * basis.transpose();
		rhs += basis * value.ln();
		count += 1;
	}
	if count < 3 {
		return Err(Error::PickFit(format!("only {count} samples to fit")));
	}
	let c = normal.lu().solve(&rhs).ok_or_else(|| Error::PickFit("singular pick fit".to_string()))?;
	if c[2].is_nan() || c[2] >= 0.0 {
		return Err(Error::PickFit("onset pulse is not concave".to_string()));
	}
	Ok((c[0], c[1], c[2]))
}
