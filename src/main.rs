use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;

use flight_tracker_rs::altimeter::AltitudeFusionEngine;
use flight_tracker_rs::bus::Topic;
use flight_tracker_rs::cloud::{AuthSignal, AuthState, HttpUploader, StaticToken, UploadQueue};
use flight_tracker_rs::config::{LocationPreferences, TrackerConfig};
use flight_tracker_rs::location::{
    BluetoothLocationSource, LocationArbitrator, LocationSource, NmeaLocationSource,
    PlatformLocationSource,
};
use flight_tracker_rs::storage::{FixedDirectory, StorageDirResolver};
use flight_tracker_rs::tracks::{read_session, SessionSummary, TrackRecorder, TrackStateRegistry};
use flight_tracker_rs::types::{PressureSample, SensorSample};

#[derive(Parser, Debug)]
#[command(name = "flight_tracker")]
#[command(about = "Barometric/GPS altitude fusion and flight track recorder", long_about = None)]
struct Args {
    /// JSON config file (missing sections use defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Track directory (overrides config)
    #[arg(long, global = true)]
    track_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay recorded NMEA and barometer data into a new session file
    Record {
        /// NMEA log, one sentence per line
        #[arg(long)]
        nmea: Option<PathBuf>,

        /// Barometer CSV: millis,pressure_hpa
        #[arg(long)]
        baro: Option<PathBuf>,
    },

    /// List finished session files, newest first
    List,

    /// Run one upload pass over every pending session
    Upload {
        /// Bearer token for the track server
        #[arg(long, env = "FLIGHT_TRACKER_TOKEN")]
        token: String,
    },

    /// Print statistics for a session file
    Summary {
        /// Path to a track_*.csv.gz file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };
    let track_dir = args
        .track_dir
        .clone()
        .or_else(|| config.storage.track_dir.clone());

    match args.command {
        Command::Record { nmea, baro } => {
            let dir = resolve_track_dir(track_dir)?;
            record(&config, dir, nmea.as_deref(), baro.as_deref())
        }
        Command::List => list(&resolve_track_dir(track_dir)?),
        Command::Upload { token } => upload(&config, resolve_track_dir(track_dir)?, token).await,
        Command::Summary { file } => summary(&file),
    }
}

fn resolve_track_dir(track_dir: Option<PathBuf>) -> Result<FixedDirectory> {
    match track_dir {
        Some(dir) => Ok(FixedDirectory::new(dir)),
        None => FixedDirectory::default_location()
            .context("no track directory configured and $HOME is not set"),
    }
}

fn record(
    config: &TrackerConfig,
    dir: FixedDirectory,
    nmea_path: Option<&Path>,
    baro_path: Option<&Path>,
) -> Result<()> {
    if nmea_path.is_none() && baro_path.is_none() {
        bail!("nothing to record: pass --nmea and/or --baro");
    }

    let nmea_lines = match nmea_path {
        Some(path) => read_lines(path)?,
        None => Vec::new(),
    };
    let pressures = match baro_path {
        Some(path) => read_baro_csv(path)?,
        None => Vec::new(),
    };

    let registry = Arc::new(TrackStateRegistry::new());
    let engine = Arc::new(AltitudeFusionEngine::new(config.fusion.clone()));
    engine.start();

    // A replayed log is pushed below; otherwise the configured port is read
    let nmea = Arc::new(NmeaLocationSource::new(None));
    let prefs = match nmea_path {
        Some(_) => LocationPreferences::default(),
        None => config.location.clone(),
    };
    let platform = Arc::new(PlatformLocationSource::new());
    let bluetooth = Arc::new(BluetoothLocationSource::new());
    let arbitrator =
        LocationArbitrator::new(nmea.clone(), platform.clone(), bluetooth, engine.clone());
    arbitrator.start(&prefs)?;

    let sensors: Topic<SensorSample> = Topic::new("sensors");
    let recorder = TrackRecorder::new(registry);
    recorder.attach(engine.altitudes(), arbitrator.fixes(), &sensors);
    let resolver: Arc<dyn StorageDirResolver> = Arc::new(dir);
    if recorder.start(resolver).join().is_err() {
        bail!("storage resolver panicked");
    }
    let track = recorder.start_logging()?;
    println!("Recording to {}", track);

    // Interleave the two inputs proportionally
    let (n_lines, n_baro) = (nmea_lines.len(), pressures.len());
    let mut next_baro = 0usize;
    for (i, line) in nmea_lines.iter().enumerate() {
        let due = (i + 1) * n_baro / n_lines;
        while next_baro < due {
            submit_pressure(&engine, pressures[next_baro]);
            next_baro += 1;
        }
        nmea.feed_line(line);
    }
    while next_baro < n_baro {
        submit_pressure(&engine, pressures[next_baro]);
        next_baro += 1;
    }

    // Drain every stage before closing the file
    nmea.fixes().flush();
    platform.fixes().flush();
    arbitrator.stop();
    engine.stop();
    engine.altitudes().flush();
    arbitrator.fixes().flush();

    let status = engine.status();
    let stats = nmea.stats();
    let finished = recorder.stop_logging()?;
    let Some(track) = finished else {
        bail!("session was not saved");
    };

    println!("Recorded {} ({})", track.display_name(), recorder.log_time());
    println!(
        "  NMEA: {} sentences, {} rejected, {} fixes",
        stats.sentences, stats.rejected, stats.fixes
    );
    println!(
        "  Altitude: {:.1} m, climb {:.2} m/s, AGL {:.1} m",
        status.altitude, status.climb, status.altitude_agl
    );
    Ok(())
}

fn submit_pressure(engine: &AltitudeFusionEngine, sample: PressureSample) {
    if let Err(e) = engine.submit_pressure(sample) {
        log::warn!("[replay] pressure sample dropped: {}", e);
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(lines)
}

/// `millis,pressure_hpa` per line; lines that do not parse (headers) are skipped.
fn read_baro_csv(path: &Path) -> Result<Vec<PressureSample>> {
    let mut samples = Vec::new();
    for line in read_lines(path)? {
        let mut cols = line.split(',');
        let parsed = match (cols.next(), cols.next()) {
            (Some(millis), Some(pressure)) => millis
                .trim()
                .parse::<i64>()
                .ok()
                .zip(pressure.trim().parse::<f64>().ok()),
            _ => None,
        };
        match parsed {
            Some((millis, pressure)) => samples.push(PressureSample::new(
                millis.saturating_mul(1_000_000),
                millis,
                pressure,
            )),
            None => log::debug!("[replay] skipping baro line {:?}", line),
        }
    }
    Ok(samples)
}

fn list(dir: &FixedDirectory) -> Result<()> {
    let path = dir.resolve().context("track directory unavailable")?;
    let registry = TrackStateRegistry::new();
    let tracks = registry.list_tracks(&path)?;
    if tracks.is_empty() {
        println!("No tracks in {}", path.display());
        return Ok(());
    }
    for track in &tracks {
        println!(
            "{}  {:>6} kB  {}",
            track.display_name(),
            track.size_kb(),
            track.file_name()
        );
    }
    Ok(())
}

async fn upload(config: &TrackerConfig, dir: FixedDirectory, token: String) -> Result<()> {
    let path = dir.resolve().context("track directory unavailable")?;
    let uploader = HttpUploader::new(&config.cloud);
    println!("Uploading to {}", uploader.url());

    let registry = Arc::new(TrackStateRegistry::new());
    let queue = UploadQueue::new(
        registry.clone(),
        &path,
        Arc::new(uploader),
        Arc::new(StaticToken(token)),
        AuthSignal::new(AuthState::SignedIn),
        tokio::runtime::Handle::current(),
    );

    // Uploaded files move to synced/, so list them first
    let pending = registry.list_tracks(&path)?;
    let pass = queue.tend().context("upload pass did not start")?;
    let report = pass.await?;
    for track in &pending {
        if let Some(data) = queue.completed(track) {
            println!("  {} → {}", track.display_name(), data.track_url);
        }
    }
    println!(
        "{} attempted, {} uploaded, {} failed",
        report.attempted, report.uploaded, report.failed
    );
    if report.failed > 0 {
        bail!("{} upload(s) failed", report.failed);
    }
    Ok(())
}

fn summary(file: &Path) -> Result<()> {
    let log = read_session(file)?;
    let summary = SessionSummary::from_log(&log);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
