//! Continuous 4-D coalescence scan, collapsed to one record per time step.

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{LowAvailabilityPolicy, ScanConfig, StackMode};
use crate::error::{Error, Result};
use crate::grid::GeoPoint;
use crate::lut::{Phase, SampleOffsets, TravelTimeTable};
use crate::onset::OnsetSource;

/// Maximum coalescence for one origin time.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalescenceRecord {
	pub time: DateTime<Utc>,
	pub coa: f64,
	/// `coa` divided by the mean over all cells.
	pub coa_norm: f64,
	pub location: GeoPoint,
	/// Stations contributing at the argmax cell.
	pub n_stations: usize,
	/// Fewer than `min_stations` contributed.
	pub low_confidence: bool,
	pub availability: Vec<bool>,
}

/// Append-only destination for committed scan batches.
pub trait SeriesSink {
	fn append(&mut self, records: &[CoalescenceRecord]) -> Result<()>;
}

/// In-memory coalescence series, strictly ordered by time.
#[derive(Debug, Clone, Default)]
pub struct CoalescenceSeries {
	records: Vec<CoalescenceRecord>,
}

impl CoalescenceSeries {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_records(records: Vec<CoalescenceRecord>) -> Result<Self> {
		let mut series = Self::new();
		series.append(&records)?;
		Ok(series)
	}

	#[must_use]
	pub fn records(&self) -> &[CoalescenceRecord] {
		&self.records
	}

	#[must_use]
	pub fn len(&self) -> usize {
		self.records.len()
	}

	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}
}

impl SeriesSink for CoalescenceSeries {
	fn append(&mut self, records: &[CoalescenceRecord]) -> Result<()> {
		let mut last = self.records.last().map(|r| r.time);
		for record in records {
			if last.is_some_and(|t| record.time <= t) {
				return Err(Error::config(format!("coalescence record at {} is out of order", record.time)));
			}
			last = Some(record.time);
		}
		self.records.extend_from_slice(records);
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
	pub steps: usize,
	/// Station-steps with no data at the argmax cell.
	pub station_gaps: usize,
	pub low_confidence: usize,
	pub cancelled: bool,
}

pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
	let delta = to - from;
	delta.num_nanoseconds().map_or_else(|| delta.num_milliseconds() as f64 * 1e-3, |ns| ns as f64 * 1e-9)
}

pub(crate) fn add_seconds(time: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
	time + Duration::nanoseconds((seconds * 1e9).round() as i64)
}

/// Stacking kernel over one onset source and one set of sample offsets.
/// Channel order follows [`SampleOffsets`].
///
/// Every cell is normalised by the same channel count: both phases of each
/// station holding data anywhere in the window. A gap inside the window
/// lowers the stack rather than shrinking the denominator.
pub(crate) struct Stack<'a> {
	offsets: &'a SampleOffsets,
	traces: Vec<Option<&'a [f64]>>,
	mode: StackMode,
	available: usize,
}

impl<'a> Stack<'a> {
	/// Kernel for origins whose shifted samples fall in `[from, to)`.
	pub(crate) fn new<S: OnsetSource + ?Sized>(
		source: &'a S,
		offsets: &'a SampleOffsets,
		mode: StackMode,
		from: i64,
		to: i64,
	) -> Self {
		let n_stations = offsets.n_stations();
		let traces: Vec<Option<&[f64]>> = Phase::ALL
			.iter()
			.flat_map(|&phase| (0..n_stations).map(move |station| source.trace(station, phase)))
			.collect();
		let has_data = |trace: Option<&[f64]>| {
			let lo = usize::try_from(from).unwrap_or(0);
			let hi = usize::try_from(to).unwrap_or(0);
			trace.is_some_and(|t| t.get(lo..hi.min(t.len())).is_some_and(|w| w.iter().any(|v| v.is_finite())))
		};
		let available = (0..n_stations)
			.filter(|&station| Phase::ALL.iter().any(|&phase| has_data(traces[offsets.channel(station, phase)])))
			.count();
		Self { offsets, traces, mode, available }
	}

	/// Stations holding data anywhere in the window.
	pub(crate) const fn available(&self) -> usize {
		self.available
	}

	fn sample(&self, channel: usize, index: i64) -> Option<f64> {
		let index = usize::try_from(index).ok()?;
		self.traces[channel]?.get(index).copied().filter(|v| v.is_finite())
	}

	fn station_sample(&self, station: usize, phase: Phase, cell: usize, origin: i64) -> Result<f64> {
		let channel = self.offsets.channel(station, phase);
		let index = origin + i64::from(self.offsets.for_cell(cell)[channel]);
		self.sample(channel, index).ok_or(Error::DataGap { station, phase, sample: index })
	}

	/// Stacked value of one cell for the origin sample `origin`. A missing
	/// sample adds zero to a sum and a factor of one to a product.
	pub(crate) fn cell_value(&self, cell: usize, origin: i64) -> f64 {
		if self.available == 0 {
			return 0.0;
		}
		let mut total = 0.0;
		for (channel, &shift) in self.offsets.for_cell(cell).iter().enumerate() {
			if let Some(value) = self.sample(channel, origin + i64::from(shift)) {
				total += match self.mode {
					StackMode::Sum => value,
					StackMode::Product => value.ln(),
				};
			}
		}
		let mean = total / (Phase::ALL.len() * self.available) as f64;
		match self.mode {
			StackMode::Sum => mean,
			StackMode::Product => mean.exp(),
		}
	}

	pub(crate) fn fill(&self, origin: i64, volume: &mut [f64]) {
		for (cell, value) in volume.iter_mut().enumerate() {
			*value = self.cell_value(cell, origin);
		}
	}

	/// Whether each station has either phase at `cell` for this origin.
	pub(crate) fn availability(&self, cell: usize, origin: i64) -> Vec<bool> {
		(0..self.offsets.n_stations())
			.map(|station| Phase::ALL.iter().any(|&phase| self.station_sample(station, phase, cell, origin).is_ok()))
			.collect()
	}
}

/// First (lowest flat index) maximum of a volume.
pub(crate) fn argmax(volume: &[f64]) -> (usize, f64) {
	let mut best = (0, f64::NEG_INFINITY);
	for (cell, &value) in volume.iter().enumerate() {
		if value > best.1 {
			best = (cell, value);
		}
	}
	best
}

/// Detection scanner: migrates onsets through a (possibly decimated)
/// travel-time table and keeps the per-step maximum.
pub struct Scanner {
	config: ScanConfig,
	table: TravelTimeTable,
	offsets: SampleOffsets,
}

impl Scanner {
	pub fn new(config: ScanConfig, table: &TravelTimeTable) -> Result<Self> {
		config.validate()?;
		let table = table.decimate(config.decimation)?;
		let offsets = table.sample_offsets(config.sampling_rate);
		info!(
			cells = table.grid().n_cells(),
			stations = table.n_stations(),
			decimation = ?config.decimation,
			max_offset = offsets.max_offset(),
			"Scanner ready"
		);
		Ok(Self { config, table, offsets })
	}

	#[must_use]
	pub const fn config(&self) -> &ScanConfig {
		&self.config
	}

	/// Table the scan runs on, after decimation.
	#[must_use]
	pub const fn table(&self) -> &TravelTimeTable {
		&self.table
	}

	/// Number of origin times in `[start, end)`.
	pub fn n_steps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<usize> {
		if end <= start {
			return Err(Error::config(format!("scan end {end} must be after start {start}")));
		}
		let span = seconds_between(start, end);
		let steps = (span / self.config.time_step - 1e-9).ceil();
		Ok((steps as usize).max(1))
	}

	/// Scans `[start, end)` and appends one record per time step to `sink`,
	/// committing in batches. A cancelled scan leaves a valid prefix.
	pub fn scan<S, K>(
		&self,
		source: &S,
		start: DateTime<Utc>,
		end: DateTime<Utc>,
		cancel: &CancelToken,
		sink: &mut K,
	) -> Result<ScanSummary>
	where
		S: OnsetSource + ?Sized,
		K: SeriesSink + ?Sized,
	{
		check_source(&self.config, &self.table, source)?;
		let n_steps = self.n_steps(start, end)?;
		let step_samples = self.config.step_samples();
		let step_nanos = (self.config.time_step * 1e9).round() as i64;
		let first_origin = (seconds_between(source.start_time(), start) * self.config.sampling_rate).round() as i64;

		self.check_padding(source, first_origin, n_steps);

		let last_origin = first_origin + (n_steps as i64 - 1) * step_samples;
		let window_end = last_origin + self.offsets.max_offset() as i64 + 1;
		let stack = Stack::new(source, &self.offsets, self.config.stack_mode, first_origin, window_end);
		let n_cells = self.table.grid().n_cells();
		let mut summary = ScanSummary::default();

		info!(%start, %end, steps = n_steps, stations = stack.available(), "Starting coalescence scan");

		let mut step = 0;
		while step < n_steps {
			if cancel.is_cancelled() {
				warn!(committed = summary.steps, "Scan cancelled");
				summary.cancelled = true;
				break;
			}
			let batch_end = (step + self.config.batch_size).min(n_steps);

			let records: Vec<CoalescenceRecord> = (step..batch_end)
				.into_par_iter()
				.map_init(
					|| vec![0.0; n_cells],
					|volume, i| {
						let origin = first_origin + i as i64 * step_samples;
						let time = start + Duration::nanoseconds(i as i64 * step_nanos);
						self.step_record(&stack, origin, time, volume)
					},
				)
				.collect();

			for record in &records {
				summary.station_gaps += record.availability.iter().filter(|a| !**a).count();
				summary.low_confidence += usize::from(record.low_confidence);
			}
			sink.append(&records)?;
			summary.steps += records.len();
			debug!(from = step, to = batch_end, "Committed scan batch");

			step = batch_end;
		}

		if summary.station_gaps > 0 {
			warn!(gaps = summary.station_gaps, "Stations missing onset data for some steps");
		}
		info!(steps = summary.steps, low_confidence = summary.low_confidence, "Scan finished");
		Ok(summary)
	}

	fn step_record(&self, stack: &Stack<'_>, origin: i64, time: DateTime<Utc>, volume: &mut [f64]) -> CoalescenceRecord {
		stack.fill(origin, volume);
		let (cell, max) = argmax(volume);
		let mean = volume.iter().sum::<f64>() / volume.len() as f64;
		let mut coa = max;
		let mut coa_norm = if mean > 0.0 { max / mean } else { 0.0 };

		let availability = stack.availability(cell, origin);
		let n_stations = availability.iter().filter(|a| **a).count();
		let low_confidence = n_stations < self.config.min_stations;
		if low_confidence && self.config.low_availability == LowAvailabilityPolicy::Suppress {
			coa = 0.0;
			coa_norm = 0.0;
		}

		let grid = self.table.grid();
		let location = grid.to_geographic(grid.node_xyz(grid.unflatten(cell)));
		CoalescenceRecord { time, coa, coa_norm, location, n_stations, low_confidence, availability }
	}

	fn check_padding<S: OnsetSource + ?Sized>(&self, source: &S, first_origin: i64, n_steps: usize) {
		let pre = (self.config.pre_pad * self.config.sampling_rate).round() as i64;
		let post_pad = self.config.post_pad_or(self.table.max_travel_time());
		let post = (post_pad * self.config.sampling_rate).round() as i64;
		let last_origin = first_origin + (n_steps as i64 - 1) * self.config.step_samples();
		let available = source.n_samples() as i64;

		if first_origin - pre < 0 || last_origin + post > available {
			warn!(
				needed_from = first_origin - pre,
				needed_to = last_origin + post,
				available,
				"Onset data does not cover the padded scan window"
			);
		}
	}
}

pub(crate) fn check_source<S: OnsetSource + ?Sized>(config: &ScanConfig, table: &TravelTimeTable, source: &S) -> Result<()> {
	let rate = source.sampling_rate();
	if (rate - config.sampling_rate).abs() > 1e-9 * config.sampling_rate {
		return Err(Error::config(format!(
			"onset sampling rate {rate} Hz does not match configured {} Hz",
			config.sampling_rate
		)));
	}
	if source.n_stations() != table.n_stations() {
		return Err(Error::config(format!(
			"onset source has {} stations, travel-time table has {}",
			source.n_stations(),
			table.n_stations()
		)));
	}
	Ok(())
}
