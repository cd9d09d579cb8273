//! Refines trigger candidates into located events on the full grid.

mod pick;
mod spline;
mod uncertainty;

use chrono::{DateTime, Utc};
use ndarray::Array3;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::{LocateConfig, ScanConfig};
use crate::error::{Error, Result};
use crate::grid::GeoPoint;
use crate::lut::{Phase, SampleOffsets, TravelTimeTable};
use crate::onset::OnsetSource;
use crate::scan::{Stack, add_seconds, argmax, check_source, seconds_between};
use crate::trigger::Candidate;

use self::pick::{Arrivals, gaussian_pick};

/// A location with per-axis standard deviation in metres (x, y, z).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
	pub location: GeoPoint,
	pub error: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PickEstimate {
	pub time: DateTime<Utc>,
	/// Standard deviation of the fitted Gaussian, seconds.
	pub error: f64,
	pub snr: f64,
}

/// Modelled arrival at one station, with the picked arrival if the onset
/// supported one.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
	pub station: String,
	pub phase: Phase,
	pub modelled_time: DateTime<Utc>,
	pub estimate: Option<PickEstimate>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
	pub id: String,
	pub origin_time: DateTime<Utc>,
	pub coa: f64,
	/// Spline-refined location of the marginal coalescence peak.
	pub location: GeoPoint,
	pub local_gaussian: Estimate,
	pub global_covariance: Estimate,
	pub picks: Vec<Pick>,
}

/// Best origin found by stepping through a candidate's search window.
struct Origin {
	sample: i64,
	coa: f64,
}

pub struct Locator<'a> {
	config: LocateConfig,
	scan: ScanConfig,
	table: &'a TravelTimeTable,
	offsets: SampleOffsets,
}

impl<'a> Locator<'a> {
	/// Locator over the undecimated `table`. Decimation in `scan` is ignored.
	pub fn new(config: LocateConfig, scan: ScanConfig, table: &'a TravelTimeTable) -> Result<Self> {
		config.validate()?;
		scan.validate()?;
		let offsets = table.sample_offsets(scan.sampling_rate);
		Ok(Self { config, scan, table, offsets })
	}

	#[must_use]
	pub const fn config(&self) -> &LocateConfig {
		&self.config
	}

	/// Locates every candidate, skipping those whose coalescence peak falls
	/// outside their marginal window. Events are returned in origin-time
	/// order.
	pub fn locate<S: OnsetSource + ?Sized>(&self, source: &S, candidates: &[Candidate], cancel: &CancelToken) -> Result<Vec<Event>> {
		check_source(&self.scan, self.table, source)?;

		let mut events = Vec::with_capacity(candidates.len());
		for candidate in candidates {
			if cancel.is_cancelled() {
				warn!(located = events.len(), "Locate cancelled");
				break;
			}
			if let Some(event) = self.locate_one(source, candidate)? {
				events.push(event);
			}
		}
		events.sort_by(|a, b| a.origin_time.cmp(&b.origin_time).then_with(|| a.id.cmp(&b.id)));
		info!(events = events.len(), candidates = candidates.len(), "Locate finished");
		Ok(events)
	}

	fn locate_one<S: OnsetSource + ?Sized>(&self, source: &S, candidate: &Candidate) -> Result<Option<Event>> {
		let rate = self.scan.sampling_rate;
		let window = (self.config.marginal_window * rate).round() as i64;
		let centre = (seconds_between(source.start_time(), candidate.coa_time) * rate).round() as i64;
		let (from, to) = (centre - 2 * window, centre + 2 * window);
		let stack = Stack::new(source, &self.offsets, self.scan.stack_mode, from, to + self.offsets.max_offset() as i64 + 1);
		debug!(event = %candidate.id, stations = stack.available(), "Stations with onset data around candidate");

		let origin = self.best_origin(&stack, from, to);
		if (origin.sample - centre).abs() > window {
			warn!(
				event = %candidate.id,
				offset = (origin.sample - centre) as f64 / rate,
				"Coalescence peak outside marginal window, skipping candidate"
			);
			return Ok(None);
		}

		let grid = self.table.grid();
		let map = self.marginal_map(&stack, origin.sample - window, origin.sample + window)?;
		let (peak_flat, _) = argmax(map.as_slice().unwrap_or(&[]));
		let peak = grid.unflatten(peak_flat);
		let gridded = grid.node_xyz(peak);

		let refined = spline::refine(&map, peak, self.config.spline_window, self.config.spline_upscale).map_or_else(
			|| {
				debug!(event = %candidate.id, "Spline window leaves the grid, using gridded peak");
				gridded
			},
			|frac| grid.position_xyz(frac),
		);

		let local_gaussian = self.local_gaussian(&map, gridded, &candidate.id);
		let (mean, std) = uncertainty::covariance(&map, grid, self.config.covariance_threshold);
		let global_covariance = Estimate { location: grid.to_geographic(mean), error: std };

		let origin_time = add_seconds(source.start_time(), origin.sample as f64 / rate);
		let picks = self.picks(source, origin.sample, origin_time, grid.nearest_cell(refined));
		let picked = picks.iter().filter(|p| p.estimate.is_some()).count();

		let event = Event {
			id: candidate.id.clone(),
			origin_time,
			coa: origin.coa,
			location: grid.to_geographic(refined),
			local_gaussian,
			global_covariance,
			picks,
		};
		info!(
			event = %event.id,
			origin = %event.origin_time,
			coa = event.coa,
			lon = event.location.longitude,
			lat = event.location.latitude,
			depth = event.location.depth,
			picked,
			"Located event"
		);
		Ok(Some(event))
	}

	/// Step with the highest coalescence in `[from, to]`, earliest on ties.
	fn best_origin(&self, stack: &Stack<'_>, from: i64, to: i64) -> Origin {
		let n_cells = self.table.grid().n_cells();
		let steps = (to - from + 1).max(1) as usize;
		let maxima: Vec<f64> = (0..steps)
			.into_par_iter()
			.map_init(
				|| vec![0.0; n_cells],
				|volume, i| {
					stack.fill(from + i as i64, volume);
					argmax(volume).1
				},
			)
			.collect();
		let (best, coa) = argmax(&maxima);
		Origin { sample: from + best as i64, coa }
	}

	/// Per-cell log-sum-exp of coalescence over origins `[from, to]`,
	/// normalised to a maximum of one.
	fn marginal_map(&self, stack: &Stack<'_>, from: i64, to: i64) -> Result<Array3<f64>> {
		let grid = self.table.grid();
		let values: Vec<f64> = (0..grid.n_cells())
			.into_par_iter()
			.map(|cell| {
				let samples: Vec<f64> = (from..=to).map(|origin| stack.cell_value(cell, origin)).collect();
				let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
				max + samples.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
			})
			.collect();
		let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
		let [nx, ny, nz] = grid.cell_count();
		let map = Array3::from_shape_vec((nx, ny, nz), values).map_err(|e| Error::geometry(e.to_string()))?;
		Ok(if max > 0.0 { map.mapv(|v| v / max) } else { map })
	}

	fn local_gaussian(&self, map: &Array3<f64>, gridded: [f64; 3], id: &str) -> Estimate {
		let grid = self.table.grid();
		let smoothed = uncertainty::smooth(map, self.config.smoothing_sigma);
		if let Some((centre, sigma)) = uncertainty::gaussian_fit(&smoothed, self.config.gaussian_window) {
			let cell = grid.cell_size();
			return Estimate {
				location: grid.to_geographic(grid.position_xyz(centre)),
				error: [sigma[0] * cell[0], sigma[1] * cell[1], sigma[2] * cell[2]],
			};
		}
		warn!(event = %id, "Local Gaussian fit failed, using gridded peak");
		Estimate { location: grid.to_geographic(gridded), error: grid.cell_size() }
	}

	fn picks<S: OnsetSource + ?Sized>(&self, source: &S, origin: i64, origin_time: DateTime<Utc>, cell: [usize; 3]) -> Vec<Pick> {
		let rate = self.scan.sampling_rate;
		let window = (self.config.marginal_window * rate).round() as i64;
		let mut picks = Vec::with_capacity(self.table.n_stations() * 2);

		for (index, station) in self.table.stations().iter().enumerate() {
			let travel_times = Phase::ALL.map(|phase| self.table.travel_time(index, phase, cell));
			let arrivals = travel_times.map(|tt| origin + (tt * rate).round() as i64);
			let from = origin - 2 * window;
			let to = arrivals[1] + 2 * window + 1;

			for phase in Phase::ALL {
				let modelled_time = add_seconds(origin_time, travel_times[phase.index()]);
				let estimate = source.trace(index, phase).and_then(|trace| {
					let lo = from.clamp(0, trace.len() as i64);
					let hi = to.clamp(lo, trace.len() as i64);
					let segment = &trace[lo as usize..hi as usize];
					let relative = Arrivals { samples: arrivals.map(|a| a - lo), travel_times };
					match gaussian_pick(segment, rate, &relative, phase, self.config.marginal_window, &self.config.pick) {
						Ok(fit) => Some(PickEstimate {
							time: add_seconds(source.start_time(), (lo as f64 + fit.centre) / rate),
							error: fit.sigma,
							snr: fit.snr(),
						}),
						Err(e) => {
							debug!(station = %station.name, %phase, error = %e, "No pick");
							None
						},
					}
				});
				picks.push(Pick { station: station.name.clone(), phase, modelled_time, estimate });
			}
		}
		picks
	}
}
