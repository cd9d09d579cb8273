//! JSON persistence for [`TravelTimeTable`], guarded by a SHA-256 fingerprint
//! of the grid geometry and station set.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use ndarray::Array5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use super::TravelTimeTable;
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::station::Station;

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize)]
struct PersistedRef<'a> {
	version: u32,
	grid: &'a Grid,
	stations: &'a [Station],
	fingerprint: String,
	times: &'a Array5<f64>,
}

#[derive(Deserialize)]
struct Persisted {
	version: u32,
	grid: Grid,
	stations: Vec<Station>,
	fingerprint: String,
	times: Array5<f64>,
}

/// Hex SHA-256 over the serialised grid and station list.
pub fn fingerprint(grid: &Grid, stations: &[Station]) -> Result<String> {
	let bytes = serde_json::to_vec(&(grid, stations))?;
	let digest = Sha256::digest(&bytes);
	Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

impl TravelTimeTable {
	pub fn save(&self, path: &Path) -> Result<()> {
		let document = PersistedRef {
			version: FORMAT_VERSION,
			grid: &self.grid,
			stations: &self.stations,
			fingerprint: fingerprint(&self.grid, &self.stations)?,
			times: &self.times,
		};

		let mut writer = BufWriter::new(File::create(path)?);
		serde_json::to_writer(&mut writer, &document)?;
		writer.flush()?;

		info!(path = %path.display(), fingerprint = %document.fingerprint, "Travel-time table saved");
		Ok(())
	}

	/// Restores a table, rejecting it if its stored fingerprint no longer
	/// matches the geometry it carries.
	pub fn load(path: &Path) -> Result<Self> {
		let reader = BufReader::new(File::open(path)?);
		let document: Persisted = serde_json::from_reader(reader)?;

		if document.version != FORMAT_VERSION {
			return Err(Error::geometry(format!(
				"travel-time file version {} is not supported (expected {FORMAT_VERSION})",
				document.version
			)));
		}
		let actual = fingerprint(&document.grid, &document.stations)?;
		if actual != document.fingerprint {
			return Err(Error::geometry(format!(
				"travel-time file fingerprint {} does not match its contents ({actual})",
				document.fingerprint
			)));
		}

		info!(path = %path.display(), fingerprint = %actual, "Travel-time table loaded");
		Self::from_parts(document.grid, document.stations, document.times)
	}

	/// Restores a table and requires it to have been built for exactly this
	/// grid and station set.
	pub fn load_checked(path: &Path, grid: &Grid, stations: &[Station]) -> Result<Self> {
		let table = Self::load(path)?;
		let expected = fingerprint(grid, stations)?;
		let actual = fingerprint(&table.grid, &table.stations)?;
		if expected != actual {
			return Err(Error::geometry(format!(
				"travel-time file {} was built for a different grid or station set",
				path.display()
			)));
		}
		Ok(table)
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use super::*;
	use crate::grid::{GeoPoint, Projection};
	use crate::lut::{Phase, VelocityModel};

	fn temp_path(name: &str) -> PathBuf {
		std::env::temp_dir().join(format!("backproject-{name}-{}.json", std::process::id()))
	}

	fn table() -> TravelTimeTable {
		let grid = Grid::new(
			GeoPoint::new(-17.3, 64.5, -1000.0),
			GeoPoint::new(-17.2, 64.55, 6000.0),
			[1000.0, 1000.0, 1000.0],
			Projection::LocalTangent { origin_lon: -17.3, origin_lat: 64.5 },
		)
		.unwrap();
		let stations = vec![Station::new("SKR01", -17.25, 64.52, 450.0), Station::new("SKR02", -17.21, 64.54, 620.0)];
		TravelTimeTable::build(grid, stations, &VelocityModel::Homogeneous { vp: 5800.0, vs: 3300.0 }).unwrap()
	}

	#[test]
	fn test_round_trip_preserves_every_lookup() {
		let table = table();
		let path = temp_path("round-trip");
		table.save(&path).unwrap();
		let restored = TravelTimeTable::load(&path).unwrap();
		std::fs::remove_file(&path).unwrap();

		assert_eq!(restored.grid(), table.grid());
		assert_eq!(restored.stations(), table.stations());
		let grid = table.grid();
		for station in 0..table.n_stations() {
			for phase in Phase::ALL {
				for cell in 0..grid.n_cells() {
					let index = grid.unflatten(cell);
					assert_eq!(restored.travel_time(station, phase, index), table.travel_time(station, phase, index));
				}
			}
		}
	}

	#[test]
	fn test_load_checked_rejects_different_station_set() {
		let table = table();
		let path = temp_path("station-mismatch");
		table.save(&path).unwrap();

		let mut stations = table.stations().to_vec();
		stations.pop();
		let result = TravelTimeTable::load_checked(&path, table.grid(), &stations);
		let accepted = TravelTimeTable::load_checked(&path, table.grid(), table.stations());
		std::fs::remove_file(&path).unwrap();

		assert!(matches!(result, Err(Error::Geometry(_))));
		assert!(accepted.is_ok());
	}

	#[test]
	fn test_tampered_geometry_fails_fingerprint() {
		let table = table();
		let path = temp_path("tampered");
		table.save(&path).unwrap();

		let text = std::fs::read_to_string(&path).unwrap();
		let tampered = text.replacen("SKR01", "SKR09", 1);
		std::fs::write(&path, tampered).unwrap();
		let result = TravelTimeTable::load(&path);
		std::fs::remove_file(&path).unwrap();

		assert!(matches!(result, Err(Error::Geometry(_))));
	}
}
