//! Tabular output: coalescence series, triggered candidates, events and
//! picks as comma-separated text with fixed column order.
//!
//! Absent pick fields are written as `-1`. Floats use fixed precision so a
//! rerun over the same input is byte-identical.

use std::io::{self, BufRead, Write};

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::grid::GeoPoint;
use crate::locate::{Estimate, Event, Pick};
use crate::scan::{CoalescenceRecord, SeriesSink};
use crate::trigger::Candidate;

pub const SERIES_HEADER: &str = "DT,COA,COA_N,X,Y,Z,NSTA,FLAG,AVAIL";
pub const CANDIDATE_HEADER: &str = "EventID,CoaTime,COA_V,COA_X,COA_Y,COA_Z,MinTime,MaxTime";
pub const EVENT_HEADER: &str = "DT,COA,X,Y,Z,\
	LocalGaussian_X,LocalGaussian_Y,LocalGaussian_Z,LocalGaussian_ErrX,LocalGaussian_ErrY,LocalGaussian_ErrZ,\
	GlobalCovariance_X,GlobalCovariance_Y,GlobalCovariance_Z,GlobalCovariance_ErrX,GlobalCovariance_ErrY,GlobalCovariance_ErrZ";
pub const PICK_HEADER: &str = "Name,Phase,ModelledTime,PickTime,PickError,SNR";

const NO_PICK: &str = "-1";
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

fn time(value: DateTime<Utc>) -> String {
	value.format(TIME_FORMAT).to_string()
}

fn point(value: &GeoPoint) -> String {
	format!("{:.6},{:.6},{:.3}", value.longitude, value.latitude, value.depth)
}

fn estimate(value: &Estimate) -> String {
	format!("{},{:.3},{:.3},{:.3}", point(&value.location), value.error[0], value.error[1], value.error[2])
}

fn invalid(line: usize, message: impl std::fmt::Display) -> io::Error {
	io::Error::new(io::ErrorKind::InvalidData, format!("line {line}: {message}"))
}

fn parse_time(field: &str, line: usize) -> io::Result<DateTime<Utc>> {
	DateTime::parse_from_rfc3339(field).map(|t| t.with_timezone(&Utc)).map_err(|e| invalid(line, e))
}

fn parse<T: std::str::FromStr>(field: &str, line: usize) -> io::Result<T>
where
	T::Err: std::fmt::Display,
{
	field.parse().map_err(|e| invalid(line, format!("{field:?}: {e}")))
}

/// Splits the data rows of a table, checking the header and column count.
fn rows<R: BufRead>(reader: R, header: &str) -> Result<Vec<(usize, Vec<String>)>> {
	let columns = header.split(',').count();
	let mut rows = Vec::new();
	for (index, line) in reader.lines().enumerate() {
		let line = line?;
		let number = index + 1;
		if index == 0 {
			if line.trim() != header {
				return Err(invalid(number, format!("expected header {header:?}")).into());
			}
			continue;
		}
		if line.trim().is_empty() {
			continue;
		}
		let fields: Vec<String> = line.split(',').map(|f| f.trim().to_string()).collect();
		if fields.len() != columns {
			return Err(invalid(number, format!("expected {columns} columns, got {}", fields.len())).into());
		}
		rows.push((number, fields));
	}
	Ok(rows)
}

/// Appends coalescence records as they are committed, flushing after each
/// batch so an interrupted scan leaves whole rows only.
pub struct SeriesWriter<W: Write> {
	inner: W,
}

impl<W: Write> SeriesWriter<W> {
	/// Starts a new table, writing the header.
	pub fn new(mut inner: W) -> Result<Self> {
		writeln!(inner, "{SERIES_HEADER}")?;
		Ok(Self { inner })
	}

	/// Continues an existing table without rewriting the header.
	pub const fn resume(inner: W) -> Self {
		Self { inner }
	}

	pub fn into_inner(self) -> W {
		self.inner
	}
}

impl<W: Write> SeriesSink for SeriesWriter<W> {
	fn append(&mut self, records: &[CoalescenceRecord]) -> Result<()> {
		for record in records {
			let availability: String = record.availability.iter().map(|a| if *a { '1' } else { '0' }).collect();
			writeln!(
				self.inner,
				"{},{:.6},{:.6},{},{},{},{}",
				time(record.time),
				record.coa,
				record.coa_norm,
				point(&record.location),
				record.n_stations,
				u8::from(record.low_confidence),
				availability
			)?;
		}
		self.inner.flush()?;
		Ok(())
	}
}

pub fn read_series<R: BufRead>(reader: R) -> Result<Vec<CoalescenceRecord>> {
	rows(reader, SERIES_HEADER)?
		.into_iter()
		.map(|(line, f)| -> Result<CoalescenceRecord> {
			let availability = f[8]
				.chars()
				.map(|c| match c {
					'1' => Ok(true),
					'0' => Ok(false),
					other => Err(invalid(line, format!("bad availability flag {other:?}"))),
				})
				.collect::<io::Result<Vec<bool>>>()?;
			Ok(CoalescenceRecord {
				time: parse_time(&f[0], line)?,
				coa: parse(&f[1], line)?,
				coa_norm: parse(&f[2], line)?,
				location: GeoPoint::new(parse(&f[3], line)?, parse(&f[4], line)?, parse(&f[5], line)?),
				n_stations: parse(&f[6], line)?,
				low_confidence: parse::<u8>(&f[7], line)? != 0,
				availability,
			})
		})
		.collect()
}

pub fn write_candidates<W: Write>(mut writer: W, candidates: &[Candidate]) -> Result<()> {
	writeln!(writer, "{CANDIDATE_HEADER}")?;
	for c in candidates {
		writeln!(
			writer,
			"{},{},{:.6},{},{},{}",
			c.id,
			time(c.coa_time),
			c.coa_value,
			point(&c.location),
			time(c.min_time),
			time(c.max_time)
		)?;
	}
	writer.flush()?;
	Ok(())
}

pub fn read_candidates<R: BufRead>(reader: R) -> Result<Vec<Candidate>> {
	rows(reader, CANDIDATE_HEADER)?
		.into_iter()
		.map(|(line, f)| -> Result<Candidate> {
			Ok(Candidate {
				id: f[0].clone(),
				coa_time: parse_time(&f[1], line)?,
				coa_value: parse(&f[2], line)?,
				location: GeoPoint::new(parse(&f[3], line)?, parse(&f[4], line)?, parse(&f[5], line)?),
				min_time: parse_time(&f[6], line)?,
				max_time: parse_time(&f[7], line)?,
			})
		})
		.collect()
}

pub fn write_events<W: Write>(mut writer: W, events: &[Event]) -> Result<()> {
	writeln!(writer, "{EVENT_HEADER}")?;
	for event in events {
		writeln!(
			writer,
			"{},{:.6},{},{},{}",
			time(event.origin_time),
			event.coa,
			point(&event.location),
			estimate(&event.local_gaussian),
			estimate(&event.global_covariance)
		)?;
	}
	writer.flush()?;
	Ok(())
}

pub fn write_picks<W: Write>(mut writer: W, picks: &[Pick]) -> Result<()> {
	writeln!(writer, "{PICK_HEADER}")?;
	for pick in picks {
		let picked = pick.estimate.map_or_else(
			|| format!("{NO_PICK},{NO_PICK},{NO_PICK}"),
			|e| format!("{},{:.4},{:.3}", time(e.time), e.error, e.snr),
		);
		writeln!(writer, "{},{},{},{}", pick.station, pick.phase, time(pick.modelled_time), picked)?;
	}
	writer.flush()?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use chrono::{Duration, TimeZone};

	use super::*;
	use crate::error::Error;
	use crate::locate::PickEstimate;
	use crate::lut::Phase;

	fn start() -> DateTime<Utc> {
		Utc.with_ymd_and_hms(2024, 6, 1, 12, 30, 0).unwrap()
	}

	fn record(offset_ms: i64) -> CoalescenceRecord {
		CoalescenceRecord {
			time: start() + Duration::milliseconds(offset_ms),
			coa: 2.5,
			coa_norm: 1.25,
			location: GeoPoint::new(-17.25, 64.5, 3500.0),
			n_stations: 3,
			low_confidence: true,
			availability: vec![true, false, true, true],
		}
	}

	#[test]
	fn test_series_lines_and_read_back() {
		let mut writer = SeriesWriter::new(Vec::new()).unwrap();
		writer.append(&[record(0), record(20)]).unwrap();
		let bytes = writer.into_inner();
		let text = String::from_utf8(bytes.clone()).unwrap();

		let mut lines = text.lines();
		assert_eq!(lines.next(), Some(SERIES_HEADER));
		assert_eq!(
			lines.next(),
			Some("2024-06-01T12:30:00.000000Z,2.500000,1.250000,-17.250000,64.500000,3500.000,3,1,1011")
		);

		let records = read_series(bytes.as_slice()).unwrap();
		assert_eq!(records, vec![record(0), record(20)]);
	}

	#[test]
	fn test_read_series_rejects_wrong_header() {
		let result = read_series("DT,COA\n".as_bytes());
		assert!(matches!(result, Err(Error::Io(_))));
	}

	#[test]
	fn test_candidates_read_back() {
		let candidate = Candidate {
			id: "20240601123000000".to_string(),
			coa_time: start(),
			coa_value: 4.5,
			location: GeoPoint::new(1.0, 2.0, 300.0),
			min_time: start() - Duration::seconds(1),
			max_time: start() + Duration::seconds(1),
		};
		let mut bytes = Vec::new();
		write_candidates(&mut bytes, std::slice::from_ref(&candidate)).unwrap();
		assert_eq!(read_candidates(bytes.as_slice()).unwrap(), vec![candidate]);
	}

	#[test]
	fn test_missing_pick_uses_sentinels() {
		let picks = vec![
			Pick {
				station: "ST01".to_string(),
				phase: Phase::P,
				modelled_time: start(),
				estimate: Some(PickEstimate { time: start() + Duration::milliseconds(15), error: 0.02, snr: 3.25 }),
			},
			Pick { station: "ST01".to_string(), phase: Phase::S, modelled_time: start(), estimate: None },
		];
		let mut bytes = Vec::new();
		write_picks(&mut bytes, &picks).unwrap();
		let text = String::from_utf8(bytes).unwrap();
		let lines: Vec<&str> = text.lines().collect();

		assert_eq!(lines[0], PICK_HEADER);
		assert_eq!(lines[1], "ST01,P,2024-06-01T12:30:00.000000Z,2024-06-01T12:30:00.015000Z,0.0200,3.250");
		assert_eq!(lines[2], "ST01,S,2024-06-01T12:30:00.000000Z,-1,-1,-1");
	}

	#[test]
	fn test_event_header_has_seventeen_columns() {
		assert_eq!(EVENT_HEADER.split(',').count(), 17);
	}
}
