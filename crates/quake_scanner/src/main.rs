mod config;

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backproject::output::{self, SeriesWriter};
use backproject::{CancelToken, Locator, OnsetData, Scanner, TravelTimeTable, Trigger, Waveforms};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::Config;

const SERIES_FILE: &str = "coalescence.csv";
const CANDIDATES_FILE: &str = "triggered_events.csv";
const EVENTS_FILE: &str = "events.csv";
const PICKS_DIR: &str = "picks";

#[derive(Parser, Debug)]
#[command(about = "Detect and locate earthquakes by coalescence of onset functions")]
struct Cli {
	/// Run configuration.
	#[arg(long, short, default_value = "config.toml")]
	config: String,

	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Computes the travel-time table and writes it to `run.lut`.
	BuildLut,
	/// Scans the run window and writes the coalescence series.
	Detect,
	/// Picks event candidates from the coalescence series.
	Trigger,
	/// Locates triggered candidates and writes events and picks.
	Locate,
}

/// Filtered three-component waveforms for every station, in station order.
#[derive(Debug, Deserialize)]
struct WaveformFile {
	start_time: DateTime<Utc>,
	sampling_rate: f64,
	stations: Vec<Option<Waveforms>>,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.init();

	let cli = Cli::parse();

	let config = Config::load(&cli.config).context("Failed to load configuration")?;
	info!("✅ Configuration loaded");

	fs::create_dir_all(&config.run.output_dir)
		.with_context(|| format!("Failed to create output directory: {}", config.run.output_dir.display()))?;

	let cancel = CancelToken::new();
	match cli.command {
		Command::BuildLut => run_blocking(cancel, move |_| build_lut(&config)).await,
		Command::Detect => run_blocking(cancel, move |cancel| detect(&config, &cancel)).await,
		Command::Trigger => run_blocking(cancel, move |_| trigger(&config)).await,
		Command::Locate => run_blocking(cancel, move |cancel| locate(&config, &cancel)).await,
	}
}

/// Runs `job` on the blocking pool; Ctrl-C trips the cancel token and waits
/// for the job to stop at its next commit point.
async fn run_blocking<F>(cancel: CancelToken, job: F) -> Result<()>
where
	F: FnOnce(CancelToken) -> Result<()> + Send + 'static,
{
	let worker = cancel.clone();
	let mut handle = tokio::task::spawn_blocking(move || job(worker));

	tokio::select! {
		result = &mut handle => result.context("Worker task panicked")?,
		_ = tokio::signal::ctrl_c() => {
			warn!("Interrupt received, stopping at the next commit point");
			cancel.cancel();
			handle.await.context("Worker task panicked")?
		},
	}
}

fn build_lut(config: &Config) -> Result<()> {
	let grid = config.grid()?;
	let model = config.velocity_model()?;
	info!(cells = grid.n_cells(), stations = config.stations.len(), model = model.name(), "Building travel-time table");

	let table = TravelTimeTable::build(grid, config.stations.clone(), &model).context("Failed to build travel-time table")?;
	table.save(&config.run.lut).with_context(|| format!("Failed to write {}", config.run.lut.display()))?;

	info!(path = %config.run.lut.display(), max_travel_time = table.max_travel_time(), "✅ Travel-time table written");
	Ok(())
}

fn load_table(config: &Config) -> Result<TravelTimeTable> {
	let grid = config.grid()?;
	TravelTimeTable::load_checked(&config.run.lut, &grid, &config.stations)
		.with_context(|| format!("Failed to load travel-time table {}", config.run.lut.display()))
}

fn load_onsets(config: &Config) -> Result<OnsetData> {
	if let Some(path) = &config.run.onsets {
		let data: OnsetData = serde_json::from_reader(BufReader::new(open(path)?))
			.with_context(|| format!("Failed to parse onsets: {}", path.display()))?;
		data.validate()?;
		return Ok(data);
	}

	let (Some(path), Some(methods)) = (&config.run.waveforms, &config.onset) else {
		anyhow::bail!("set run.onsets or run.waveforms to provide onset data");
	};
	let file: WaveformFile = serde_json::from_reader(BufReader::new(open(path)?))
		.with_context(|| format!("Failed to parse waveforms: {}", path.display()))?;
	info!(stations = file.stations.len(), "Computing onset functions");
	OnsetData::from_waveforms(file.start_time, file.sampling_rate, &methods.p, &methods.s, &file.stations)
		.context("Failed to compute onset functions")
}

fn open(path: &Path) -> Result<File> {
	File::open(path).with_context(|| format!("Failed to open {}", path.display()))
}

fn create(path: &Path) -> Result<BufWriter<File>> {
	Ok(BufWriter::new(File::create(path).with_context(|| format!("Failed to create {}", path.display()))?))
}

fn output_path(config: &Config, name: &str) -> PathBuf {
	config.run.output_dir.join(name)
}

fn detect(config: &Config, cancel: &CancelToken) -> Result<()> {
	let table = load_table(config)?;
	let onsets = load_onsets(config)?;
	let scanner = Scanner::new(config.scan.clone(), &table)?;

	let path = output_path(config, SERIES_FILE);
	let mut writer = SeriesWriter::new(create(&path)?)?;
	let summary = scanner.scan(&onsets, config.run.start, config.run.end, cancel, &mut writer)?;

	if summary.cancelled {
		warn!(steps = summary.steps, path = %path.display(), "Detect interrupted, series holds a partial window");
	} else {
		info!(steps = summary.steps, path = %path.display(), "✅ Coalescence series written");
	}
	Ok(())
}

fn trigger(config: &Config) -> Result<()> {
	let series_path = output_path(config, SERIES_FILE);
	let series = output::read_series(BufReader::new(open(&series_path)?))
		.with_context(|| format!("Failed to read {}", series_path.display()))?;

	let trigger = Trigger::new(config.trigger.clone())?;
	let candidates = trigger.trigger(&series, config.run.start, config.run.end);

	let path = output_path(config, CANDIDATES_FILE);
	output::write_candidates(create(&path)?, &candidates)?;
	info!(candidates = candidates.len(), path = %path.display(), "✅ Triggered events written");
	Ok(())
}

fn locate(config: &Config, cancel: &CancelToken) -> Result<()> {
	let candidates_path = output_path(config, CANDIDATES_FILE);
	let candidates = output::read_candidates(BufReader::new(open(&candidates_path)?))
		.with_context(|| format!("Failed to read {}", candidates_path.display()))?;
	if candidates.is_empty() {
		warn!("No triggered events to locate");
		return Ok(());
	}

	let table = load_table(config)?;
	let onsets = load_onsets(config)?;
	let locator = Locator::new(config.locate.clone(), config.scan.clone(), &table)?;
	let events = locator.locate(&onsets, &candidates, cancel)?;

	let path = output_path(config, EVENTS_FILE);
	output::write_events(create(&path)?, &events)?;

	let picks_dir = output_path(config, PICKS_DIR);
	fs::create_dir_all(&picks_dir).with_context(|| format!("Failed to create {}", picks_dir.display()))?;
	for event in &events {
		let pick_path = picks_dir.join(format!("{}.picks.csv", event.id));
		output::write_picks(create(&pick_path)?, &event.picks)?;
	}

	info!(events = events.len(), path = %path.display(), "✅ Located events written");
	Ok(())
}
