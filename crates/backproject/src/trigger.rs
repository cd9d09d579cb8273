//! Reduces a coalescence series to discrete event candidates.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::{Normalisation, TriggerConfig};
use crate::error::Result;
use crate::grid::GeoPoint;
use crate::scan::{CoalescenceRecord, add_seconds, seconds_between};

/// Format of event ids derived from the peak time.
pub const EVENT_ID_FORMAT: &str = "%Y%m%d%H%M%S%3f";

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
	pub id: String,
	pub coa_time: DateTime<Utc>,
	pub coa_value: f64,
	pub location: GeoPoint,
	pub min_time: DateTime<Utc>,
	pub max_time: DateTime<Utc>,
}

#[must_use]
pub fn event_id(time: DateTime<Utc>) -> String {
	time.format(EVENT_ID_FORMAT).to_string()
}

pub struct Trigger {
	config: TriggerConfig,
}

impl Trigger {
	pub fn new(config: TriggerConfig) -> Result<Self> {
		config.validate()?;
		Ok(Self { config })
	}

	#[must_use]
	pub const fn config(&self) -> &TriggerConfig {
		&self.config
	}

	/// Candidates whose peak lies in `[start, end]`, ordered by time and at
	/// least `minimum_repeat` apart.
	#[must_use]
	pub fn trigger(&self, series: &[CoalescenceRecord], start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Candidate> {
		self.check_padding(series, start, end);

		let values = self.normalised(series);
		let step = nominal_step(series);
		let threshold = self.config.detection_threshold;

		let mut peaks = Vec::new();
		let mut run: Option<(usize, usize)> = None;
		for (i, record) in series.iter().enumerate() {
			let inside = record.time >= start && record.time <= end;
			if inside && values[i] >= threshold {
				run = match run {
					Some((first, last)) if seconds_between(series[last].time, record.time) <= step * 1.5 => Some((first, i)),
					Some(previous) => {
						peaks.push(self.peak(series, &values, previous));
						Some((i, i))
					},
					None => Some((i, i)),
				};
			} else if let Some(previous) = run.take() {
				peaks.push(self.peak(series, &values, previous));
			}
		}
		if let Some(previous) = run {
			peaks.push(self.peak(series, &values, previous));
		}

		let candidates = self.merge(peaks);
		info!(candidates = candidates.len(), threshold, "Trigger finished");
		candidates
	}

	/// Peak of one above-threshold run, with its extent widened by the
	/// marginal window and minimum repeat.
	fn peak(&self, series: &[CoalescenceRecord], values: &[f64], (first, last): (usize, usize)) -> Candidate {
		let mut best = first;
		for i in first..=last {
			if values[i] > values[best] {
				best = i;
			}
		}

		let marginal = self.config.marginal_window;
		let repeat = self.config.minimum_repeat;
		let peak_time = series[best].time;
		let run_start = series[first].time;
		let run_end = series[last].time;

		let min_time = if seconds_between(run_start, peak_time) < marginal {
			add_seconds(peak_time, -(marginal + repeat))
		} else {
			add_seconds(run_start, -repeat)
		};
		let max_time = if seconds_between(peak_time, run_end) < marginal {
			add_seconds(peak_time, marginal + repeat)
		} else {
			add_seconds(run_end, repeat)
		};

		Candidate {
			id: event_id(peak_time),
			coa_time: peak_time,
			coa_value: values[best],
			location: series[best].location,
			min_time,
			max_time,
		}
	}

	/// Chains peaks whose windows touch the next peak's marginal window and
	/// keeps the largest of each chain; ties go to the earliest.
	fn merge(&self, peaks: Vec<Candidate>) -> Vec<Candidate> {
		let mut merged: Vec<Candidate> = Vec::new();
		let mut chain: Option<Candidate> = None;
		let mut chain_end = None;

		for peak in peaks {
			let joins = chain_end.is_some_and(|end: DateTime<Utc>| {
				seconds_between(end, add_seconds(peak.coa_time, -self.config.marginal_window)) <= 0.0
			});
			match chain.take() {
				Some(mut current) if joins => {
					current.min_time = current.min_time.min(peak.min_time);
					current.max_time = current.max_time.max(peak.max_time);
					if peak.coa_value > current.coa_value {
						current.id = peak.id;
						current.coa_time = peak.coa_time;
						current.coa_value = peak.coa_value;
						current.location = peak.location;
					}
					chain_end = Some(peak.max_time);
					chain = Some(current);
				},
				previous => {
					merged.extend(previous);
					chain_end = Some(peak.max_time);
					chain = Some(peak);
				},
			}
		}
		merged.extend(chain);
		merged
	}

	fn normalised(&self, series: &[CoalescenceRecord]) -> Vec<f64> {
		match self.config.normalisation {
			Normalisation::None => series.iter().map(|r| r.coa).collect(),
			Normalisation::Grid => series.iter().map(|r| r.coa_norm).collect(),
			Normalisation::TrailingMedian { window } => {
				let mut values = Vec::with_capacity(series.len());
				let mut first = 0;
				for (i, record) in series.iter().enumerate() {
					while seconds_between(series[first].time, record.time) > window {
						first += 1;
					}
					let median = median(series[first..=i].iter().map(|r| r.coa).collect());
					values.push(if median > 0.0 { record.coa / median } else { 0.0 });
				}
				values
			},
		}
	}

	fn check_padding(&self, series: &[CoalescenceRecord], start: DateTime<Utc>, end: DateTime<Utc>) {
		let (Some(first), Some(last)) = (series.first(), series.last()) else {
			warn!(%start, %end, "Empty coalescence series");
			return;
		};
		let wanted_start = add_seconds(start, -self.config.pad);
		let wanted_end = add_seconds(end, self.config.pad);
		if first.time > wanted_start || last.time < wanted_end {
			warn!(
				series_start = %first.time,
				series_end = %last.time,
				%wanted_start,
				%wanted_end,
				"Coalescence series does not cover the padded trigger window"
			);
		}
	}
}

fn nominal_step(series: &[CoalescenceRecord]) -> f64 {
	series
		.windows(2)
		.map(|pair| seconds_between(pair[0].time, pair[1].time))
		.filter(|dt| *dt > 0.0)
		.fold(f64::INFINITY, f64::min)
}

fn median(mut values: Vec<f64>) -> f64 {
	values.sort_by(f64::total_cmp);
	let n = values.len();
	if n == 0 {
		0.0
	} else if n % 2 == 1 {
		values[n / 2]
	} else {
		f64::midpoint(values[n / 2 - 1], values[n / 2])
	}
}
