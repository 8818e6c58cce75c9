//! The data writer worker and the cross-restart settings/calibration
//! store.
//!
//! The writer owns no hardware; it only ever touches the filesystem. It is
//! the single consumer of the save queue, so CSV row ordering within a
//! per-day file matches send order even though wavelength-column widths
//! vary only by device, never by request.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::NaiveDate;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use directories::{BaseDirs, ProjectDirs};
use log::{info, warn};
use plotters::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::Reference;
use crate::error::{Result, SpectroError};
use crate::flags::SystemFlags;
use crate::limits::paths;
use crate::scan::SaveRequest;
use crate::settings::SpectrometerSettings;

// ---------------------------------------------------------------------------
// Save queue plumbing
// ---------------------------------------------------------------------------

/// Set when a disk write fails or the save queue could not accept a request
/// within its timeout. Cleared by the UI once it has shown the
/// transient banner, via [`SaveErrorFlag::take`].
#[derive(Clone, Default)]
pub struct SaveErrorFlag(Arc<AtomicBool>);

impl SaveErrorFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Reads and clears the flag in one step.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Enqueues a save request, blocking up to `timeout` if the queue is full
/// ("block-with-timeout on full; if timeout exceeded, surface an error
/// flag"). The UI is the only caller; it never blocks on hardware, but a
/// bounded wait on a nearly-instantaneous consumer is acceptable.
pub fn send_with_timeout(
    tx: &Sender<SaveRequest>,
    request: SaveRequest,
    timeout: Duration,
    error_flag: &SaveErrorFlag,
) {
    if tx.send_timeout(request, timeout).is_err() {
        warn!("save queue: timed out waiting for space; request dropped");
        error_flag.set();
    }
}

// ---------------------------------------------------------------------------
// Data writer worker
// ---------------------------------------------------------------------------

/// Spawns the data writer on its own thread. Consumes `save_rx` until the
/// channel disconnects and the shutdown flag is set; each request is
/// best-effort: a failure logs, sets
/// `error_flag`, and the writer keeps running.
pub fn spawn(
    data_dir: PathBuf,
    save_rx: Receiver<SaveRequest>,
    flags: SystemFlags,
    error_flag: SaveErrorFlag,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("data-writer".into())
        .spawn(move || {
            let mut daily_scan_counts: HashMap<NaiveDate, u32> = HashMap::new();
            loop {
                match save_rx.recv_timeout(Duration::from_millis(200)) {
                    Ok(request) => {
                        if let Err(e) = process(&data_dir, &request, &mut daily_scan_counts) {
                            warn!("data writer: failed to save {} row: {e}", request.spectra_type.as_str());
                            error_flag.set();
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if flags.shutdown.is_set() && save_rx.is_empty() {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            info!("data writer thread exiting");
        })
        .expect("failed to spawn data-writer thread")
}

fn process(
    data_dir: &Path,
    request: &SaveRequest,
    daily_scan_counts: &mut HashMap<NaiveDate, u32>,
) -> Result<()> {
    let day = request.timestamp.date_naive();
    let day_str = day.format("%Y-%m-%d").to_string();
    let day_dir = data_dir.join(&day_str);
    fs::create_dir_all(&day_dir)?;

    let csv_path = day_dir.join(format!("{day_str}_{}", crate::limits::paths::CSV_BASE_FILENAME));
    append_csv_row(&csv_path, request)?;

    if request.spectra_type.wants_png_plot() {
        let count = daily_scan_counts.entry(day).or_insert(0);
        *count += 1;
        let png_name = format!(
            "spectrum_{}_{}_{}.png",
            request.spectra_type.as_str(),
            request.lens_type.as_str(),
            request.timestamp.format("%Y-%m-%d-%H%M%S"),
        );
        render_plot(&day_dir.join(png_name), request, *count)?;
    }

    Ok(())
}

/// CSV schema. Header is written once, iff the file did not previously
/// exist or was empty.
fn append_csv_row(path: &Path, request: &SaveRequest) -> Result<()> {
    let needs_header = !path.exists() || fs::metadata(path)?.len() == 0;
    if needs_header {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        let mut header = vec![
            "timestamp_utc".to_string(),
            "spectra_type".to_string(),
            "lens_type".to_string(),
            "integration_time_ms".to_string(),
            "temperature_c".to_string(),
        ];
        header.extend(request.wavelengths.iter().map(|w| format!("{w:.2}")));
        writer.write_record(&header)?;
        writer.flush()?;
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
    let mut row = vec![
        request.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        request.spectra_type.as_str().to_string(),
        request.lens_type.as_str().to_string(),
        request.integration_time_ms.to_string(),
        request
            .temperature_c
            .map(|t| format!("{t:.1}"))
            .unwrap_or_default(),
    ];
    row.extend(request.intensities.iter().map(|v| format!("{v:.4}")));
    writer.write_record(&row)?;
    writer.flush()?;
    Ok(())
}

fn plot_io_error<E: std::fmt::Display>(e: E) -> SpectroError {
    SpectroError::Persistence(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

/// One labeled line plot per sample save, full-spectrum (resolved:
/// CSV/PNG are full-spectrum, only the live renderer crops).
fn render_plot(path: &Path, request: &SaveRequest, scan_count: u32) -> Result<()> {
    let root = BitMapBackend::new(path, (800, 480)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_io_error)?;

    let x_min = request.wavelengths.first().copied().unwrap_or(0.0);
    let x_max = request.wavelengths.last().copied().unwrap_or(1.0).max(x_min + 1.0);
    let y_max = request
        .intensities
        .iter()
        .cloned()
        .fold(0.0_f64, f64::max)
        .max(1.0)
        * 1.1;

    let title = format!(
        "{} | {} | {} ms | scan #{}",
        request.spectra_type.as_str(),
        request.lens_type.as_str(),
        request.integration_time_ms,
        scan_count,
    );

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 20))
        .margin(15)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(x_min..x_max, 0.0..y_max)
        .map_err(plot_io_error)?;

    chart
        .configure_mesh()
        .x_desc("Wavelength (nm)")
        .y_desc("Intensity")
        .draw()
        .map_err(plot_io_error)?;

    chart
        .draw_series(LineSeries::new(
            request
                .wavelengths
                .iter()
                .zip(request.intensities.iter())
                .map(|(&w, &v)| (w, v)),
            &BLUE,
        ))
        .map_err(plot_io_error)?;

    root.present().map_err(plot_io_error)?;
    Ok(())
}

/// `$HOME/pysb-app/spectra_data`.
pub fn default_data_dir() -> Result<PathBuf> {
    let base = BaseDirs::new().ok_or_else(|| {
        SpectroError::Persistence(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine home directory",
        ))
    })?;
    Ok(base.home_dir().join("pysb-app").join(paths::DATA_DIR_NAME))
}

// ---------------------------------------------------------------------------
// Cross-restart settings/calibration persistence
// ---------------------------------------------------------------------------

/// Everything the menu and acquisition engine need to pick up where the
/// last clean shutdown left off.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub settings: SpectrometerSettings,
    pub fan_threshold_c: i32,
    pub dark_reference: Option<Reference>,
    pub white_reference: Option<Reference>,
}

fn config_path() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "abyss-instruments", "abyss-spectro").ok_or_else(|| {
        SpectroError::Persistence(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "could not determine config directory",
        ))
    })?;
    let dir = dirs.config_dir();
    fs::create_dir_all(dir)?;
    Ok(dir.join("settings.json"))
}

/// Loads the persisted config, or `AppConfig::default()` if none exists yet
/// (first run).
pub fn load_config() -> Result<AppConfig> {
    let path = config_path()?;
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let json = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

/// Saves the config. Called on clean shutdown.
pub fn save_config(config: &AppConfig) -> Result<()> {
    let path = config_path()?;
    let json = serde_json::to_string_pretty(config)?;
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SpectraType;
    use crate::settings::{CollectionMode, LensType};
    use chrono::Utc;
    use tempfile::tempdir;

    fn sample_request(spectra_type: SpectraType) -> SaveRequest {
        SaveRequest {
            wavelengths: vec![400.0, 410.0, 420.0],
            intensities: vec![1.2345, 2.3456, 3.4567],
            raw_intensities: None,
            timestamp: Utc::now(),
            integration_time_ms: 500,
            spectra_type,
            collection_mode: CollectionMode::Raw,
            lens_type: LensType::Fiber,
            temperature_c: Some(21.5),
        }
    }

    #[test]
    fn csv_header_written_once_then_rows_appended() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let req = sample_request(SpectraType::Raw);
        append_csv_row(&path, &req).unwrap();
        append_csv_row(&path, &req).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3, "expected one header row + two data rows");
        assert!(lines[0].starts_with("timestamp_utc,spectra_type,lens_type"));
        assert!(lines[0].contains("400.00"));
        assert!(lines[1].contains("RAW"));
        assert!(lines[1].contains("1.2345"));
    }

    #[test]
    fn full_pipeline_writes_csv_and_png_for_sample_captures() {
        let dir = tempdir().unwrap();
        let mut counts = HashMap::new();
        let req = sample_request(SpectraType::Reflectance);
        process(dir.path(), &req, &mut counts).unwrap();

        let day_str = req.timestamp.format("%Y-%m-%d").to_string();
        let day_dir = dir.path().join(&day_str);
        let csv_path = day_dir.join(format!("{day_str}_{}", crate::limits::paths::CSV_BASE_FILENAME));
        assert!(csv_path.exists());

        let png_count = fs::read_dir(&day_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().map(|x| x == "png").unwrap_or(false))
            .count();
        assert_eq!(png_count, 1);
    }

    #[test]
    fn dark_reference_save_gets_no_png() {
        let dir = tempdir().unwrap();
        let mut counts = HashMap::new();
        let req = sample_request(SpectraType::Dark);
        process(dir.path(), &req, &mut counts).unwrap();

        let day_str = req.timestamp.format("%Y-%m-%d").to_string();
        let day_dir = dir.path().join(&day_str);
        let png_count = fs::read_dir(&day_dir)
            .unwrap()
            .filter(|e| e.as_ref().unwrap().path().extension().map(|x| x == "png").unwrap_or(false))
            .count();
        assert_eq!(png_count, 0);
    }

    #[test]
    fn save_error_flag_take_clears_after_reading() {
        let flag = SaveErrorFlag::new();
        assert!(!flag.take());
        flag.set();
        assert!(flag.take());
        assert!(!flag.take());
    }
}
