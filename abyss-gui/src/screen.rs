//! The spectrometer screen's state machine: live view, freeze/save,
//! calibration sub-states, and the auto-integration driver loop.

use abyss_spectro_core::acquisition::{Command, EngineEvent};
use abyss_spectro_core::calibration::{auto_integration_step, AutoIntegOutcome, AutoIntegState};
use abyss_spectro_core::settings::{CollectionMode, LensType, SpectrometerSettings};
use abyss_spectro_core::{CalibrationStatus, SaveRequest, ScanResult, SpectraType};
use crossbeam_channel::Sender;
use log::info;

use crate::shared::StatusBanner;

/// A logical button event, already debounced and level-triggered at the
/// source (GPIO or keyboard).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonPress {
    Up,
    Down,
    Enter,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenState {
    LiveView,
    Frozen,
    CalibrationMenu,
    LiveDarkRef,
    LiveWhiteRef,
    FrozenDarkRef,
    FrozenWhiteRef,
    AutoIntegSetup,
    AutoIntegRunning,
    AutoIntegConfirm,
}

struct AutoIntegRun {
    state: AutoIntegState,
    hw_min_us: u32,
    hw_max_us: u32,
    outstanding: bool,
    proposed_ms: Option<u32>,
    outcome_label: String,
}

/// Owns every piece of state the nine-state machine reads or mutates. The
/// containing `App` feeds it button events and engine results each frame
/// and nothing else.
pub struct SpectrometerScreen {
    state: ScreenState,
    session_id: Option<u64>,
    settings: SpectrometerSettings,
    last_synced_settings: SpectrometerSettings,
    lens_type: LensType,
    stored_mode: CollectionMode,
    calibration_status: CalibrationStatus,
    live_scan: Option<ScanResult>,
    frozen_scan: Option<ScanResult>,
    y_limits: (f64, f64),
    rescale_on_next_scan: bool,
    auto_integ: Option<AutoIntegRun>,
    banner: Option<StatusBanner>,
    latest_temperature_c: Option<f64>,
}

const DEFAULT_Y_LIMITS: (f64, f64) = (0.0, 1.2);

impl SpectrometerScreen {
    pub fn new(settings: SpectrometerSettings, lens_type: LensType) -> Self {
        let stored_mode = settings.collection_mode;
        Self {
            state: ScreenState::LiveView,
            session_id: None,
            last_synced_settings: settings.clone(),
            settings,
            lens_type,
            stored_mode,
            calibration_status: CalibrationStatus::default(),
            live_scan: None,
            frozen_scan: None,
            y_limits: DEFAULT_Y_LIMITS,
            rescale_on_next_scan: false,
            auto_integ: None,
            banner: None,
            latest_temperature_c: None,
        }
    }

    /// Records the most recent temperature reading so saved rows can carry
    /// it; called once per frame from the latest `TempStatus` snapshot.
    pub fn set_temperature(&mut self, temp_c: Option<f64>) {
        self.latest_temperature_c = temp_c;
    }

    pub fn state(&self) -> ScreenState {
        self.state
    }

    pub fn y_limits(&self) -> (f64, f64) {
        self.y_limits
    }

    pub fn live_scan(&self) -> Option<&ScanResult> {
        self.live_scan.as_ref()
    }

    pub fn frozen_scan(&self) -> Option<&ScanResult> {
        self.frozen_scan.as_ref()
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        self.calibration_status
    }

    pub fn banner(&self) -> Option<&StatusBanner> {
        self.banner.as_ref()
    }

    pub fn auto_integ_proposal(&self) -> Option<(u32, &str)> {
        self.auto_integ
            .as_ref()
            .and_then(|r| r.proposed_ms.map(|ms| (ms, r.outcome_label.as_str())))
    }

    /// Validity predicate, used to gate REFLECTANCE live view.
    fn refs_valid(&self) -> bool {
        self.calibration_status.valid_for_reflectance(&self.settings)
    }

    // -- Engine event ingestion -------------------------------------------------

    /// Freshness filter: discard stale results, apply fresh ones to the
    /// relevant live/frozen slot or feed the auto-integration driver.
    pub fn process_event(&mut self, event: EngineEvent, cmd_tx: &Sender<Command>) {
        match event {
            EngineEvent::DeviceUnhealthy(msg) => {
                self.banner = Some(StatusBanner::error(format!("Spectrometer unhealthy: {msg}")));
            }
            EngineEvent::Scan(scan) => {
                if !scan.is_valid || Some(scan.session_id) != self.session_id {
                    return;
                }
                self.merge_calibration_status(scan.calibration_status);
                match scan.spectra_type {
                    SpectraType::AutoInteg => self.feed_auto_integ(scan, cmd_tx),
                    _ => self.accept_live_scan(scan),
                }
            }
        }
    }

    /// The engine's echoed `CalibrationStatus` carries the authoritative
    /// has-ref/integration-time fields, but the "scans since" counters are
    /// owned by the UI (incremented on save). Only the validity fields are
    /// adopted here; a counter resets to zero exactly when its reference
    /// transitions (established or invalidated), never on an unrelated scan.
    fn merge_calibration_status(&mut self, incoming: CalibrationStatus) {
        if incoming.has_dark_ref != self.calibration_status.has_dark_ref
            || incoming.dark_integration_ms != self.calibration_status.dark_integration_ms
        {
            self.calibration_status.scans_since_dark = 0;
        }
        if incoming.has_white_ref != self.calibration_status.has_white_ref
            || incoming.white_integration_ms != self.calibration_status.white_integration_ms
        {
            self.calibration_status.scans_since_white = 0;
        }
        if incoming.auto_integ_completed != self.calibration_status.auto_integ_completed
            || incoming.auto_integ_integration_ms != self.calibration_status.auto_integ_integration_ms
        {
            self.calibration_status.scans_since_auto_integ = 0;
        }
        self.calibration_status.has_dark_ref = incoming.has_dark_ref;
        self.calibration_status.dark_integration_ms = incoming.dark_integration_ms;
        self.calibration_status.has_white_ref = incoming.has_white_ref;
        self.calibration_status.white_integration_ms = incoming.white_integration_ms;
        self.calibration_status.auto_integ_completed = incoming.auto_integ_completed;
        self.calibration_status.auto_integ_integration_ms = incoming.auto_integ_integration_ms;
    }

    fn accept_live_scan(&mut self, scan: ScanResult) {
        if self.rescale_on_next_scan {
            self.rescale_y_axis(&scan);
            self.rescale_on_next_scan = false;
        }
        match self.state {
            ScreenState::LiveView | ScreenState::LiveDarkRef | ScreenState::LiveWhiteRef => {
                self.live_scan = Some(scan);
            }
            _ => {}
        }
    }

    fn rescale_y_axis(&mut self, scan: &ScanResult) {
        let max = scan.intensities.iter().cloned().fold(0.0_f64, f64::max);
        self.y_limits = (0.0, (max * 1.2).max(0.1));
    }

    // -- Button dispatch ----------------------------------------------------

    pub fn handle_input(
        &mut self,
        button: ButtonPress,
        cmd_tx: &Sender<Command>,
        save_tx: &Sender<SaveRequest>,
    ) {
        match self.state {
            ScreenState::LiveView => self.handle_live_view(button, cmd_tx),
            ScreenState::Frozen => self.handle_frozen(button, cmd_tx, save_tx),
            ScreenState::CalibrationMenu => self.handle_calibration_menu(button, cmd_tx),
            ScreenState::LiveDarkRef => self.handle_live_ref(button, cmd_tx, true),
            ScreenState::LiveWhiteRef => self.handle_live_ref(button, cmd_tx, false),
            ScreenState::FrozenDarkRef => self.handle_frozen_ref(button, cmd_tx, save_tx, true),
            ScreenState::FrozenWhiteRef => self.handle_frozen_ref(button, cmd_tx, save_tx, false),
            ScreenState::AutoIntegSetup => self.handle_auto_integ_setup(button, cmd_tx),
            ScreenState::AutoIntegRunning => self.handle_auto_integ_running(button, cmd_tx),
            ScreenState::AutoIntegConfirm => self.handle_auto_integ_confirm(button, cmd_tx),
        }
    }

    fn handle_live_view(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>) {
        match button {
            ButtonPress::Enter => {
                if self.live_scan.is_some() {
                    self.frozen_scan = self.live_scan.take();
                    self.stop_session(cmd_tx);
                    self.state = ScreenState::Frozen;
                }
            }
            ButtonPress::Up => {
                self.stored_mode = self.settings.collection_mode;
                self.stop_session(cmd_tx);
                self.state = ScreenState::CalibrationMenu;
            }
            ButtonPress::Down => {
                if let Some(scan) = &self.live_scan {
                    self.y_limits = rescale_from(scan);
                } else {
                    self.rescale_on_next_scan = true;
                }
            }
            ButtonPress::Back => {
                self.stop_session(cmd_tx);
            }
        }
    }

    fn handle_frozen(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>, save_tx: &Sender<SaveRequest>) {
        match button {
            ButtonPress::Enter => {
                if let Some(scan) = self.frozen_scan.take() {
                    self.enqueue_save(&scan, save_tx);
                }
                self.start_new_session(cmd_tx);
            }
            ButtonPress::Back => {
                self.frozen_scan = None;
                self.start_new_session(cmd_tx);
            }
            _ => {}
        }
    }

    fn handle_calibration_menu(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>) {
        match button {
            ButtonPress::Enter => {
                self.force_raw_session(cmd_tx);
                self.state = ScreenState::LiveWhiteRef;
            }
            ButtonPress::Up => {
                self.force_raw_session(cmd_tx);
                self.state = ScreenState::LiveDarkRef;
            }
            ButtonPress::Down => {
                self.state = ScreenState::AutoIntegSetup;
            }
            ButtonPress::Back => {
                self.settings.collection_mode = self.stored_mode;
                self.start_new_session(cmd_tx);
            }
        }
    }

    fn handle_live_ref(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>, dark: bool) {
        match button {
            ButtonPress::Enter => {
                self.frozen_scan = self.live_scan.take();
                self.stop_session(cmd_tx);
                self.state = if dark { ScreenState::FrozenDarkRef } else { ScreenState::FrozenWhiteRef };
            }
            ButtonPress::Down => {
                if let Some(scan) = &self.live_scan {
                    self.y_limits = rescale_from(scan);
                } else {
                    self.rescale_on_next_scan = true;
                }
            }
            ButtonPress::Back => {
                self.stop_session(cmd_tx);
                self.state = ScreenState::CalibrationMenu;
            }
            ButtonPress::Up => {}
        }
    }

    fn handle_frozen_ref(
        &mut self,
        button: ButtonPress,
        cmd_tx: &Sender<Command>,
        save_tx: &Sender<SaveRequest>,
        dark: bool,
    ) {
        match button {
            ButtonPress::Enter => {
                if let Some(scan) = self.frozen_scan.take() {
                    cmd_tx
                        .send(if dark { Command::CaptureDarkRef } else { Command::CaptureWhiteRef })
                        .ok();
                    let request = SaveRequest::from_scan(
                        &scan,
                        self.settings.collection_mode,
                        self.lens_type,
                        self.latest_temperature_c,
                    );
                    save_tx.send(request).ok();
                }
                self.settings.collection_mode = self.stored_mode;
                self.start_new_session(cmd_tx);
            }
            ButtonPress::Back => {
                self.frozen_scan = None;
                self.force_raw_session(cmd_tx);
                self.state = if dark { ScreenState::LiveDarkRef } else { ScreenState::LiveWhiteRef };
            }
            _ => {}
        }
    }

    fn handle_auto_integ_setup(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>) {
        match button {
            ButtonPress::Enter => {
                let (hw_min_us, hw_max_us) = (
                    abyss_spectro_core::limits::spectrometer::HW_INTEGRATION_TIME_MIN_US,
                    abyss_spectro_core::limits::spectrometer::HW_INTEGRATION_TIME_MAX_US,
                );
                let initial_us = (self.settings.integration_time_ms as u64 * 1000)
                    .clamp(hw_min_us as u64, hw_max_us as u64) as u32;
                self.auto_integ = Some(AutoIntegRun {
                    state: AutoIntegState::new(initial_us),
                    hw_min_us,
                    hw_max_us,
                    outstanding: false,
                    proposed_ms: None,
                    outcome_label: String::new(),
                });
                self.state = ScreenState::AutoIntegRunning;
                self.run_next_auto_integ_iteration(cmd_tx);
            }
            ButtonPress::Back => {
                self.state = ScreenState::CalibrationMenu;
            }
            _ => {}
        }
    }

    fn handle_auto_integ_running(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>) {
        if button == ButtonPress::Back {
            self.auto_integ = None;
            self.stop_session(cmd_tx);
            self.state = ScreenState::CalibrationMenu;
        }
    }

    fn handle_auto_integ_confirm(&mut self, button: ButtonPress, cmd_tx: &Sender<Command>) {
        match button {
            ButtonPress::Enter => {
                if let Some(run) = self.auto_integ.take() {
                    if let Some(ms) = run.proposed_ms {
                        self.settings.set_integration_time_ms(ms);
                        self.last_synced_settings = self.settings.clone();
                        cmd_tx
                            .send(Command::UpdateSettings {
                                integration_time_ms: self.settings.integration_time_ms,
                                scans_to_average: self.settings.scans_to_average,
                            })
                            .ok();
                        self.calibration_status.has_dark_ref = false;
                        self.calibration_status.has_white_ref = false;
                        self.rescale_on_next_scan = true;
                    }
                }
                self.start_new_session(cmd_tx);
            }
            ButtonPress::Back => {
                self.auto_integ = None;
                self.state = ScreenState::CalibrationMenu;
            }
            _ => {}
        }
    }

    fn run_next_auto_integ_iteration(&mut self, cmd_tx: &Sender<Command>) {
        if let Some(run) = &mut self.auto_integ {
            if run.outstanding {
                return;
            }
            run.outstanding = true;
            cmd_tx
                .send(Command::AutoIntegCapture {
                    test_integration_us: run.state.test_integration_us,
                })
                .ok();
        }
    }

    fn feed_auto_integ(&mut self, scan: ScanResult, cmd_tx: &Sender<Command>) {
        let Some(peak) = scan.peak_adc_value else { return };
        let Some(run) = &mut self.auto_integ else { return };
        run.outstanding = false;
        let outcome = auto_integration_step(&mut run.state, peak, run.hw_min_us, run.hw_max_us);
        match outcome {
            AutoIntegOutcome::Continue { integration_time_us, .. } => {
                run.state.test_integration_us = integration_time_us;
                self.run_next_auto_integ_iteration(cmd_tx);
            }
            AutoIntegOutcome::Converged { integration_time_us } => {
                self.finish_auto_integ(integration_time_us, "converged");
            }
            AutoIntegOutcome::SaturatedAtMin { integration_time_us } => {
                self.finish_auto_integ(integration_time_us, "saturated at minimum integration time");
            }
            AutoIntegOutcome::TooDimAtMax { integration_time_us } => {
                self.finish_auto_integ(integration_time_us, "too dim even at maximum integration time");
            }
            AutoIntegOutcome::NoFurtherAdjustment { integration_time_us } => {
                self.finish_auto_integ(integration_time_us, "no further adjustment possible");
            }
            AutoIntegOutcome::MaxIterationsReached { integration_time_us } => {
                self.finish_auto_integ(integration_time_us, "reached maximum iterations");
            }
        }
    }

    fn finish_auto_integ(&mut self, integration_time_us: u32, label: &str) {
        if let Some(run) = &mut self.auto_integ {
            let proposed_ms = ((integration_time_us as f64) / 1000.0).round() as u32;
            run.proposed_ms = Some(proposed_ms);
            run.outcome_label = label.to_string();
        }
        info!("auto-integration finished: {label} ({integration_time_us} us)");
        self.state = ScreenState::AutoIntegConfirm;
    }

    // -- Session bookkeeping -------------------------------------------------

    /// Entering-live-view invariants: detect settings drift, update
    /// the local calibration mirror, gate REFLECTANCE start on reference
    /// validity, then (maybe) start a session.
    fn start_new_session(&mut self, cmd_tx: &Sender<Command>) {
        self.state = ScreenState::LiveView;
        self.live_scan = None;

        let integration_changed = self.last_synced_settings.integration_time_ms != self.settings.integration_time_ms;
        let averaging_changed = self.last_synced_settings.scans_to_average != self.settings.scans_to_average;
        if integration_changed || averaging_changed {
            cmd_tx
                .send(Command::UpdateSettings {
                    integration_time_ms: self.settings.integration_time_ms,
                    scans_to_average: self.settings.scans_to_average,
                })
                .ok();
            self.last_synced_settings = self.settings.clone();
            self.calibration_status.has_dark_ref = false;
            self.calibration_status.dark_integration_ms = None;
            self.calibration_status.has_white_ref = false;
            self.calibration_status.white_integration_ms = None;
            self.calibration_status.scans_since_dark = 0;
            self.calibration_status.scans_since_white = 0;
            if integration_changed {
                self.calibration_status.auto_integ_completed = false;
                self.calibration_status.auto_integ_integration_ms = None;
                self.calibration_status.scans_since_auto_integ = 0;
            }
        }

        if self.settings.collection_mode == CollectionMode::Reflectance && !self.refs_valid() {
            self.banner = Some(StatusBanner::info("Calibration required for reflectance mode"));
            self.session_id = None;
            return;
        }

        self.banner = None;
        cmd_tx.send(Command::SetCollectionMode(self.settings.collection_mode)).ok();
        cmd_tx.send(Command::StartSession).ok();
        self.session_id = Some(self.session_id.map(|s| s + 1).unwrap_or(1));
    }

    fn force_raw_session(&mut self, cmd_tx: &Sender<Command>) {
        self.stop_session(cmd_tx);
        self.settings.collection_mode = CollectionMode::Raw;
        cmd_tx.send(Command::SetCollectionMode(CollectionMode::Raw)).ok();
        cmd_tx.send(Command::StartSession).ok();
        self.session_id = Some(self.session_id.map(|s| s + 1).unwrap_or(1));
        self.live_scan = None;
    }

    fn stop_session(&mut self, cmd_tx: &Sender<Command>) {
        cmd_tx.send(Command::StopSession).ok();
        self.session_id = None;
    }

    fn enqueue_save(&mut self, scan: &ScanResult, save_tx: &Sender<SaveRequest>) {
        let request = SaveRequest::from_scan(
            scan,
            self.settings.collection_mode,
            self.lens_type,
            self.latest_temperature_c,
        );
        if let Some(companion) = request.raw_reflectance_companion() {
            save_tx.send(request).ok();
            save_tx.send(companion).ok();
        } else {
            save_tx.send(request).ok();
        }
        self.calibration_status.scans_since_dark = self.calibration_status.scans_since_dark.saturating_add(1);
        self.calibration_status.scans_since_white = self.calibration_status.scans_since_white.saturating_add(1);
        self.calibration_status.scans_since_auto_integ =
            self.calibration_status.scans_since_auto_integ.saturating_add(1);
    }

    pub fn settings(&self) -> &SpectrometerSettings {
        &self.settings
    }

    pub fn lens_type(&self) -> LensType {
        self.lens_type
    }

    pub fn set_lens_type(&mut self, lens_type: LensType) {
        self.lens_type = lens_type;
    }

    /// Applies a settings change made from outside the state machine (the
    /// operator's settings panel, as opposed to a button-driven transition).
    /// If the screen is already live, immediately resyncs with the engine
    /// the same way entering LIVE_VIEW would (entering-live-view
    /// invariants").
    pub fn apply_settings(&mut self, settings: SpectrometerSettings, cmd_tx: &Sender<Command>) {
        self.settings = settings;
        self.stored_mode = settings.collection_mode;
        if self.state == ScreenState::LiveView {
            self.start_new_session(cmd_tx);
        }
    }
}

fn rescale_from(scan: &ScanResult) -> (f64, f64) {
    let max = scan.intensities.iter().cloned().fold(0.0_f64, f64::max);
    (0.0, (max * 1.2).max(0.1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use abyss_spectro_core::settings::CollectionMode;
    use chrono::Utc;
    use crossbeam_channel::unbounded;

    fn scan(spectra_type: SpectraType, session_id: u64, is_valid: bool) -> ScanResult {
        ScanResult {
            wavelengths: vec![400.0, 500.0],
            intensities: vec![0.5, 0.6],
            raw_intensities: None,
            timestamp: Utc::now(),
            integration_time_ms: 500,
            spectra_type,
            session_id,
            is_valid,
            peak_adc_value: None,
            test_integration_us: None,
            calibration_status: CalibrationStatus::default(),
        }
    }

    #[test]
    fn stale_scan_is_discarded_by_freshness_filter() {
        let (tx, _rx) = unbounded();
        let mut screen = SpectrometerScreen::new(SpectrometerSettings::default(), LensType::Fiber);
        screen.start_new_session(&tx);
        let current_session = screen.session_id.unwrap();

        screen.process_event(EngineEvent::Scan(scan(SpectraType::Raw, current_session + 99, true)), &tx);
        assert!(screen.live_scan().is_none());

        screen.process_event(EngineEvent::Scan(scan(SpectraType::Raw, current_session, true)), &tx);
        assert!(screen.live_scan().is_some());
    }

    #[test]
    fn invalid_scan_is_discarded_even_with_matching_session() {
        let (tx, _rx) = unbounded();
        let mut screen = SpectrometerScreen::new(SpectrometerSettings::default(), LensType::Fiber);
        screen.start_new_session(&tx);
        let current_session = screen.session_id.unwrap();
        screen.process_event(EngineEvent::Scan(scan(SpectraType::Raw, current_session, false)), &tx);
        assert!(screen.live_scan().is_none());
    }

    #[test]
    fn reflectance_mode_without_references_shows_banner_and_does_not_start() {
        let (tx, _rx) = unbounded();
        let mut settings = SpectrometerSettings::default();
        settings.collection_mode = CollectionMode::Reflectance;
        let mut screen = SpectrometerScreen::new(settings, LensType::Fiber);
        screen.start_new_session(&tx);
        assert!(screen.session_id.is_none());
        assert!(screen.banner().is_some());
    }

    #[test]
    fn enter_freezes_live_scan_and_stops_session() {
        let (tx, rx) = unbounded();
        let mut screen = SpectrometerScreen::new(SpectrometerSettings::default(), LensType::Fiber);
        screen.start_new_session(&tx);
        let current_session = screen.session_id.unwrap();
        screen.process_event(EngineEvent::Scan(scan(SpectraType::Raw, current_session, true)), &tx);
        assert!(screen.live_scan().is_some());

        screen.handle_input(ButtonPress::Enter, &tx, &unbounded().0);
        assert_eq!(screen.state(), ScreenState::Frozen);
        assert!(screen.frozen_scan().is_some());
        assert!(matches!(rx.try_recv(), Ok(Command::StopSession)));
    }

    #[test]
    fn back_from_calibration_menu_restores_stored_mode() {
        let (tx, _rx) = unbounded();
        let mut settings = SpectrometerSettings::default();
        settings.collection_mode = CollectionMode::Reflectance;
        let mut screen = SpectrometerScreen::new(settings, LensType::Fiber);

        screen.handle_input(ButtonPress::Up, &tx, &unbounded().0);
        assert_eq!(screen.state(), ScreenState::CalibrationMenu);

        screen.handle_input(ButtonPress::Up, &tx, &unbounded().0);
        assert_eq!(screen.state(), ScreenState::LiveDarkRef);
        assert_eq!(screen.settings.collection_mode, CollectionMode::Raw);

        screen.handle_input(ButtonPress::Back, &tx, &unbounded().0);
        assert_eq!(screen.state(), ScreenState::CalibrationMenu);

        screen.handle_input(ButtonPress::Back, &tx, &unbounded().0);
        assert_eq!(screen.state(), ScreenState::LiveView);
        assert_eq!(screen.settings.collection_mode, CollectionMode::Reflectance);
    }
}
