use backproject::output::SeriesWriter;
use backproject::{
	CancelToken, CoalescenceSeries, Grid, LocateConfig, Locator, LowAvailabilityPolicy, Normalisation, OnsetData, Phase,
	Projection, ScanConfig, Scanner, Station, TravelTimeTable, Trigger, TriggerConfig, VelocityModel,
};
use chrono::{DateTime, Duration, TimeZone, Utc};

const RATE: f64 = 100.0;
const ORIGIN: usize = 300;
const SOURCE: [usize; 3] = [4, 3, 3];

fn start() -> DateTime<Utc> {
	Utc.with_ymd_and_hms(2023, 11, 10, 4, 0, 0).unwrap()
}

fn origin_time() -> DateTime<Utc> {
	start() + Duration::milliseconds((ORIGIN as f64 / RATE * 1000.0) as i64)
}

fn table() -> TravelTimeTable {
	let grid = Grid::from_parts(Projection::Cartesian, [0.0, 0.0, 0.0], [9, 9, 7], [500.0, 500.0, 500.0]).unwrap();
	let stations = vec![
		Station::new("ST01", 0.0, 0.0, 0.0),
		Station::new("ST02", 4000.0, 0.0, 0.0),
		Station::new("ST03", 0.0, 4000.0, 0.0),
		Station::new("ST04", 4000.0, 4000.0, 0.0),
		Station::new("ST05", 2000.0, 2000.0, 0.0),
	];
	TravelTimeTable::build(grid, stations, &VelocityModel::Homogeneous { vp: 5000.0, vs: 2900.0 }).unwrap()
}

fn noise(seed: u64, n: usize) -> Vec<f64> {
	let mut state = seed;
	(0..n)
		.map(|_| {
			state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1_442_695_040_888_963_407);
			0.05 + 0.1 * ((state >> 11) as f64 / (1_u64 << 53) as f64)
		})
		.collect()
}

/// Sharp Gaussian onsets at the modelled arrivals of a point source, on a
/// flat 0.1 floor. Stations listed in `noisy` carry noise only.
fn onsets(table: &TravelTimeTable, noisy: &[usize]) -> OnsetData {
	let n = 1000;
	let mut traces = [Vec::new(), Vec::new()];
	for station in 0..table.n_stations() {
		for phase in Phase::ALL {
			let trace = if noisy.contains(&station) {
				noise(17 + (station * 2 + phase.index()) as u64, n)
			} else {
				let arrival = ORIGIN as f64 + table.travel_time(station, phase, SOURCE) * RATE;
				(0..n).map(|i| 0.1 + 4.0 * (-(i as f64 - arrival).powi(2) / 2.0).exp()).collect()
			};
			traces[phase.index()].push(Some(trace));
		}
	}
	let [p, s] = traces;
	OnsetData::new(start(), RATE, p, s).unwrap()
}

fn scan_config() -> ScanConfig {
	ScanConfig::new(RATE, 0.05, LowAvailabilityPolicy::Flag)
}

fn trigger_config() -> TriggerConfig {
	TriggerConfig {
		detection_threshold: 2.5,
		marginal_window: 0.3,
		minimum_repeat: 0.5,
		normalisation: Normalisation::None,
		pad: 0.0,
	}
}

fn detect(table: &TravelTimeTable, data: &OnsetData) -> CoalescenceSeries {
	let scanner = Scanner::new(scan_config(), table).unwrap();
	let mut series = CoalescenceSeries::new();
	let summary = scanner
		.scan(data, start() + Duration::seconds(1), start() + Duration::seconds(6), &CancelToken::new(), &mut series)
		.unwrap();
	assert_eq!(summary.steps, 100);
	series
}

#[test]
fn test_detect_trigger_locate_recovers_source() {
	let table = table();
	let data = onsets(&table, &[]);
	let series = detect(&table, &data);

	let trigger = Trigger::new(trigger_config()).unwrap();
	let candidates = trigger.trigger(series.records(), start() + Duration::seconds(1), start() + Duration::seconds(6));
	assert_eq!(candidates.len(), 1);
	assert_eq!(candidates[0].coa_time, origin_time());

	let locator = Locator::new(LocateConfig::new(0.3), scan_config(), &table).unwrap();
	let events = locator.locate(&data, &candidates, &CancelToken::new()).unwrap();
	assert_eq!(events.len(), 1);
	let event = &events[0];

	assert!((event.origin_time - origin_time()).num_milliseconds().abs() <= 50);
	let expected = table.grid().node_xyz(SOURCE);
	let found = table.grid().to_xyz(event.location);
	for axis in 0..3 {
		assert!((found[axis] - expected[axis]).abs() <= 500.0, "axis {axis}: {found:?} vs {expected:?}");
	}
	assert!(event.picks.iter().all(|p| p.estimate.is_some()));
}

#[test]
fn test_missing_station_keeps_peak_and_flags_availability() {
	let table = table();
	let full = detect(&table, &onsets(&table, &[]));

	let mut data = onsets(&table, &[]);
	data.remove_station(1);
	let gapped = detect(&table, &data);

	let step = 40;
	let (with, without) = (&full.records()[step], &gapped.records()[step]);
	assert_eq!(with.time, origin_time());
	assert_eq!(with.location, without.location);
	assert!(without.coa > trigger_config().detection_threshold);
	assert_eq!(without.availability, vec![true, false, true, true, true]);
	assert!(with.availability.iter().all(|a| *a));
}

#[test]
fn test_noise_only_station_gets_no_pick() {
	let table = table();
	let data = onsets(&table, &[1]);
	let series = detect(&table, &data);
	let candidates = Trigger::new(trigger_config()).unwrap().trigger(
		series.records(),
		start() + Duration::seconds(1),
		start() + Duration::seconds(6),
	);
	assert_eq!(candidates.len(), 1);

	let locator = Locator::new(LocateConfig::new(0.3), scan_config(), &table).unwrap();
	let events = locator.locate(&data, &candidates, &CancelToken::new()).unwrap();
	assert_eq!(events.len(), 1);
	for pick in &events[0].picks {
		assert_eq!(pick.estimate.is_none(), pick.station == "ST02", "{pick:?}");
	}
}

#[test]
fn test_repeated_detect_is_byte_identical() {
	let table = table();
	let data = onsets(&table, &[]);
	let scanner = Scanner::new(scan_config(), &table).unwrap();

	let run = || {
		let mut writer = SeriesWriter::new(Vec::new()).unwrap();
		scanner
			.scan(&data, start() + Duration::seconds(1), start() + Duration::seconds(6), &CancelToken::new(), &mut writer)
			.unwrap();
		writer.into_inner()
	};
	let first = run();
	assert!(!first.is_empty());
	assert_eq!(first, run());
}
