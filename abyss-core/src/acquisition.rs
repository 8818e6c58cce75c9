//! The acquisition engine worker.
//!
//! A single dedicated thread owns the `Spectrometer` handle for its entire
//! lifetime. It cooperatively polls the command queue between captures and
//! between scans of an average; a long integration cannot be preempted
//! mid-scan.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, info, warn};

use crate::calibration::{compute_reflectance, References};
use crate::device::BoxedSpectrometer;
use crate::flags::SystemFlags;
use crate::limits::spectrometer as limits;
use crate::scan::{ScanResult, SpectraType};
use crate::settings::{CollectionMode, SharedTimeOffset, SpectrometerSettings};

/// Commands accepted from the UI.
#[derive(Debug, Clone)]
pub enum Command {
    StartSession,
    StopSession,
    UpdateSettings {
        integration_time_ms: u32,
        scans_to_average: u32,
    },
    SetCollectionMode(CollectionMode),
    CaptureDarkRef,
    CaptureWhiteRef,
    AutoIntegCapture { test_integration_us: u32 },
    Shutdown,
}

/// Everything the engine can put on the result queue: either a capture or a
/// health sentinel ("emit a sentinel device error
/// result at most once per second").
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Scan(ScanResult),
    DeviceUnhealthy(String),
    /// Echoed once as the engine thread exits, carrying the live dark/white
    /// references so the UI can persist them across a restart.
    References(References),
}

const MAX_CONSECUTIVE_FAILURES: u32 = 3;
const UNHEALTHY_EMIT_INTERVAL: Duration = Duration::from_secs(1);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct Engine {
    device: BoxedSpectrometer,
    settings: SpectrometerSettings,
    references: References,
    time: SharedTimeOffset,
    session_id: u64,
    capturing: bool,
    device_integration_us: Option<u32>,
    consecutive_failures: u32,
    unhealthy: bool,
    last_unhealthy_emit: std::time::Instant,
    command_rx: Receiver<Command>,
    result_tx: Sender<EngineEvent>,
    flags: SystemFlags,
}

/// Spawns the acquisition engine on its own OS thread.
///
/// `initial_settings`/`initial_references` seed the engine from the
/// persisted config so a restart doesn't forget the last-used
/// integration time or calibration.
pub fn spawn(
    mut device: BoxedSpectrometer,
    command_rx: Receiver<Command>,
    result_tx: Sender<EngineEvent>,
    flags: SystemFlags,
    time: SharedTimeOffset,
    initial_settings: SpectrometerSettings,
    initial_references: References,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("acquisition-engine".into())
        .spawn(move || {
            if let Err(e) = device.open() {
                warn!("acquisition engine: initial device open failed: {e}");
            }
            let mut engine = Engine {
                device,
                settings: initial_settings,
                references: initial_references,
                time,
                session_id: 0,
                capturing: false,
                device_integration_us: None,
                consecutive_failures: 0,
                unhealthy: false,
                last_unhealthy_emit: std::time::Instant::now() - UNHEALTHY_EMIT_INTERVAL,
                command_rx,
                result_tx,
                flags,
            };
            engine.run();
        })
        .expect("failed to spawn acquisition-engine thread")
}

impl Engine {
    fn run(&mut self) {
        loop {
            if self.flags.shutdown.is_set() {
                break;
            }

            if self.capturing {
                match self.command_rx.try_recv() {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                        continue;
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => break,
                }
                self.run_capture_cycle();
            } else {
                match self.command_rx.recv_timeout(IDLE_POLL_INTERVAL) {
                    Ok(cmd) => {
                        if self.handle_command(cmd) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        }
        self.push_result(EngineEvent::References(self.references.clone()));
        self.device.close();
        info!("acquisition engine thread exiting");
    }

    /// Pushes onto the bounded result queue, dropping the oldest queued
    /// event on overflow rather than the fresh one (live plot freshness >
    /// historical completeness).
    fn push_result(&self, event: EngineEvent) {
        match self.result_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let _ = self.result_tx.try_recv();
                let _ = self.result_tx.try_send(event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Returns true if the engine should stop.
    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::StartSession => {
                self.session_id += 1;
                self.capturing = true;
                if self.unhealthy {
                    match self.device.open() {
                        Ok(()) => {
                            info!("acquisition engine: device re-opened, resuming");
                            self.unhealthy = false;
                            self.consecutive_failures = 0;
                        }
                        Err(e) => debug!("acquisition engine: re-open attempt failed: {e}"),
                    }
                }
            }
            Command::StopSession => {
                self.capturing = false;
            }
            Command::UpdateSettings {
                integration_time_ms,
                scans_to_average,
            } => {
                let integration_changed = self.settings.set_integration_time_ms(integration_time_ms);
                let averaging_changed = self.settings.set_scans_to_average(scans_to_average);
                if integration_changed {
                    self.references.invalidate_on_integration_change();
                } else if averaging_changed {
                    self.references.invalidate_on_averaging_change();
                }
            }
            Command::SetCollectionMode(mode) => {
                self.settings.collection_mode = mode;
            }
            Command::CaptureDarkRef => self.capture_reference(true),
            Command::CaptureWhiteRef => self.capture_reference(false),
            Command::AutoIntegCapture {
                test_integration_us,
            } => self.auto_integ_capture(test_integration_us),
            Command::Shutdown => return true,
        }
        false
    }

    fn sync_device_integration(&mut self, requested_us: u32) {
        let (hw_min, hw_max) = self.device.integration_limits_us();
        let clamped = requested_us.clamp(hw_min, hw_max);
        if self.device_integration_us != Some(clamped) {
            if clamped != requested_us {
                warn!(
                    "acquisition engine: integration time {requested_us}us clamped to device limits [{hw_min}, {hw_max}] -> {clamped}us"
                );
            }
            match self.device.set_integration_time_us(clamped) {
                Ok(()) => self.device_integration_us = Some(clamped),
                Err(e) => self.note_failure(&e),
            }
        }
    }

    /// Cooperatively polls the command queue between scans of an average (not
    /// mid-scan: a single USB read up to the configured integration time is
    /// never preempted). A `StopSession` or `Shutdown` observed here aborts
    /// the average early rather than blocking for the remaining scans.
    fn average_scans(&mut self, scan_count: u32) -> Option<Vec<f64>> {
        let mut sum: Option<Vec<f64>> = None;
        for i in 0..scan_count {
            if i > 0 {
                match self.command_rx.try_recv() {
                    Ok(cmd) => {
                        let should_stop = self.handle_command(cmd);
                        if should_stop || !self.capturing {
                            return None;
                        }
                    }
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => return None,
                }
            }
            match self.device.read_intensities() {
                Ok(reading) => {
                    self.consecutive_failures = 0;
                    sum = Some(match sum {
                        None => reading,
                        Some(acc) => acc.iter().zip(reading.iter()).map(|(a, b)| a + b).collect(),
                    });
                }
                Err(e) => {
                    self.note_failure(&e);
                    return None;
                }
            }
        }
        sum.map(|total| total.iter().map(|v| v / scan_count as f64).collect())
    }

    fn note_failure(&mut self, err: &crate::error::SpectroError) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            self.unhealthy = true;
            let now = std::time::Instant::now();
            if now.duration_since(self.last_unhealthy_emit) >= UNHEALTHY_EMIT_INTERVAL {
                self.last_unhealthy_emit = now;
                self.push_result(EngineEvent::DeviceUnhealthy(err.to_string()));
            }
        } else {
            debug!("acquisition engine: transient failure ({}/{MAX_CONSECUTIVE_FAILURES}): {err}", self.consecutive_failures);
        }
    }

    fn run_capture_cycle(&mut self) {
        let settings = self.settings;
        let requested_us = settings.integration_time_ms.saturating_mul(1000);
        self.sync_device_integration(requested_us);

        let scan_count = settings.effective_scan_count();
        let Some(raw) = self.average_scans(scan_count) else {
            return;
        };

        let wavelengths = self.device.wavelengths().to_vec();
        let is_valid = true; // freshly captured under the current session
        let timestamp = self.time.now();
        let calibration_status = self.references.status();

        let result = match settings.collection_mode {
            CollectionMode::Raw => ScanResult {
                wavelengths,
                intensities: raw,
                raw_intensities: None,
                timestamp,
                integration_time_ms: settings.integration_time_ms,
                spectra_type: SpectraType::Raw,
                session_id: self.session_id,
                is_valid,
                peak_adc_value: None,
                test_integration_us: None,
                calibration_status,
            },
            CollectionMode::Reflectance => {
                if !self.references.valid_for_reflectance(settings.integration_time_ms) {
                    // no result, no RAW fallback.
                    return;
                }
                let dark = &self.references.dark.as_ref().unwrap().intensities;
                let white = &self.references.white.as_ref().unwrap().intensities;
                let reflectance = compute_reflectance(
                    &raw,
                    dark,
                    white,
                    limits::DIVISION_EPSILON,
                    crate::limits::plotting::Y_REFL_MAX_CEIL,
                );
                ScanResult {
                    wavelengths,
                    intensities: reflectance,
                    raw_intensities: Some(raw),
                    timestamp,
                    integration_time_ms: settings.integration_time_ms,
                    spectra_type: SpectraType::Reflectance,
                    session_id: self.session_id,
                    is_valid,
                    peak_adc_value: None,
                    test_integration_us: None,
                    calibration_status,
                }
            }
        };

        self.push_result(EngineEvent::Scan(result));
    }

    /// CAPTURE_DARK_REF / CAPTURE_WHITE_REF: a RAW average-of-N capture,
    /// serviced immediately regardless of collection mode.
    fn capture_reference(&mut self, dark: bool) {
        let settings = self.settings;
        let requested_us = settings.integration_time_ms.saturating_mul(1000);
        self.sync_device_integration(requested_us);
        let scan_count = settings.effective_scan_count();
        let Some(raw) = self.average_scans(scan_count) else {
            return;
        };

        if dark {
            self.references.set_dark(raw.clone(), settings.integration_time_ms);
        } else {
            self.references.set_white(raw.clone(), settings.integration_time_ms);
        }

        let result = ScanResult {
            wavelengths: self.device.wavelengths().to_vec(),
            intensities: raw,
            raw_intensities: None,
            timestamp: self.time.now(),
            integration_time_ms: settings.integration_time_ms,
            spectra_type: if dark { SpectraType::Dark } else { SpectraType::White },
            session_id: self.session_id,
            is_valid: true,
            peak_adc_value: None,
            test_integration_us: None,
            calibration_status: self.references.status(),
        };
        self.push_result(EngineEvent::Scan(result));
    }

    /// AUTO_INTEG_CAPTURE: single-scan, no averaging, always `AutoInteg`.
    fn auto_integ_capture(&mut self, test_integration_us: u32) {
        let (hw_min, hw_max) = self.device.integration_limits_us();
        let clamped = test_integration_us.clamp(hw_min, hw_max);
        self.sync_device_integration(clamped);

        let Ok(raw) = self.device.read_intensities() else {
            return;
        };
        self.consecutive_failures = 0;
        let peak = raw.iter().cloned().fold(f64::MIN, f64::max);

        let result = ScanResult {
            wavelengths: self.device.wavelengths().to_vec(),
            intensities: raw,
            raw_intensities: None,
            timestamp: self.time.now(),
            integration_time_ms: (clamped / 1000).max(1),
            spectra_type: SpectraType::AutoInteg,
            session_id: self.session_id,
            is_valid: true,
            peak_adc_value: Some(peak),
            test_integration_us: Some(clamped),
            calibration_status: self.references.status(),
        };
        self.push_result(EngineEvent::Scan(result));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Spectrometer;
    use crossbeam_channel::unbounded;
    use std::sync::{Arc, Mutex};

    /// A deterministic in-memory `Spectrometer` for engine tests.
    struct StubSpectrometer {
        wavelengths: Vec<f64>,
        next_reading: Arc<Mutex<Vec<f64>>>,
        integration_us: u32,
        hw_limits: (u32, u32),
        fail_reads: Arc<Mutex<u32>>,
    }

    impl Spectrometer for StubSpectrometer {
        fn open(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn wavelengths(&self) -> &[f64] {
            &self.wavelengths
        }
        fn set_integration_time_us(&mut self, us: u32) -> crate::error::Result<()> {
            self.integration_us = us;
            Ok(())
        }
        fn read_intensities(&mut self) -> crate::error::Result<Vec<f64>> {
            let mut remaining = self.fail_reads.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(crate::error::SpectroError::DeviceUnhealthy("stub failure".into()));
            }
            Ok(self.next_reading.lock().unwrap().clone())
        }
        fn integration_limits_us(&self) -> (u32, u32) {
            self.hw_limits
        }
    }

    fn harness() -> (
        Sender<Command>,
        Receiver<EngineEvent>,
        SystemFlags,
        JoinHandle<()>,
    ) {
        let stub = StubSpectrometer {
            wavelengths: vec![400.0, 410.0, 420.0],
            next_reading: Arc::new(Mutex::new(vec![100.0, 200.0, 300.0])),
            integration_us: 0,
            hw_limits: (3_800, 6_000_000),
            fail_reads: Arc::new(Mutex::new(0)),
        };
        let (cmd_tx, cmd_rx) = unbounded();
        let (res_tx, res_rx) = unbounded();
        let flags = SystemFlags::new();
        let time = SharedTimeOffset::new();
        let handle = spawn(
            Box::new(stub),
            cmd_rx,
            res_tx,
            flags.clone(),
            time,
            SpectrometerSettings::default(),
            References::new(),
        );
        (cmd_tx, res_rx, flags, handle)
    }

    #[test]
    fn raw_capture_emits_valid_scan_with_session_id() {
        let (cmd_tx, res_rx, flags, handle) = harness();
        cmd_tx.send(Command::StartSession).unwrap();
        let event = res_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            EngineEvent::Scan(scan) => {
                assert_eq!(scan.spectra_type, SpectraType::Raw);
                assert!(scan.is_valid);
                assert_eq!(scan.session_id, 1);
                assert!(scan.lengths_consistent());
            }
            other => panic!("expected a scan, got {other:?}"),
        }
        flags.shutdown.set();
        cmd_tx.send(Command::Shutdown).ok();
        handle.join().unwrap();
    }

    #[test]
    fn reflectance_mode_emits_nothing_without_valid_references() {
        let (cmd_tx, res_rx, flags, handle) = harness();
        cmd_tx
            .send(Command::SetCollectionMode(CollectionMode::Reflectance))
            .unwrap();
        cmd_tx.send(Command::StartSession).unwrap();
        // No reference captured: the engine must not emit a result at all.
        let result = res_rx.recv_timeout(Duration::from_millis(300));
        assert!(result.is_err(), "expected no result, got {result:?}");
        flags.shutdown.set();
        cmd_tx.send(Command::Shutdown).ok();
        handle.join().unwrap();
    }

    #[test]
    fn capture_dark_ref_stamps_current_integration_time() {
        let (cmd_tx, res_rx, flags, handle) = harness();
        cmd_tx
            .send(Command::UpdateSettings {
                integration_time_ms: 500,
                scans_to_average: 1,
            })
            .unwrap();
        cmd_tx.send(Command::CaptureDarkRef).unwrap();
        let event = res_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            EngineEvent::Scan(scan) => {
                assert_eq!(scan.spectra_type, SpectraType::Dark);
                assert_eq!(scan.integration_time_ms, 500);
            }
            other => panic!("expected a dark reference scan, got {other:?}"),
        }
        flags.shutdown.set();
        cmd_tx.send(Command::Shutdown).ok();
        handle.join().unwrap();
    }

    #[test]
    fn auto_integ_capture_reports_peak_and_echoes_test_value() {
        let (cmd_tx, res_rx, flags, handle) = harness();
        cmd_tx
            .send(Command::AutoIntegCapture {
                test_integration_us: 50_000,
            })
            .unwrap();
        let event = res_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        match event {
            EngineEvent::Scan(scan) => {
                assert_eq!(scan.spectra_type, SpectraType::AutoInteg);
                assert_eq!(scan.test_integration_us, Some(50_000));
                assert_eq!(scan.peak_adc_value, Some(300.0));
            }
            other => panic!("expected an auto-integ scan, got {other:?}"),
        }
        flags.shutdown.set();
        cmd_tx.send(Command::Shutdown).ok();
        handle.join().unwrap();
    }
}
