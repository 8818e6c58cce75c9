//! Top-level application: actor wiring, keyboard input, and per-frame
//! rendering of the spectrometer screen.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded};
use eframe::egui;
use log::{info, warn};

use abyss_spectro_core::acquisition::{self, Command, EngineEvent};
use abyss_spectro_core::calibration::References;
use abyss_spectro_core::device::{self, NullSpectrometer};
use abyss_spectro_core::limits::safety as safety_limits;
use abyss_spectro_core::persistence::{self, AppConfig, SaveErrorFlag};
use abyss_spectro_core::safety::{
    self, CdevGpioInput, CdevGpioOutput, FanThreshold, Mcp9808Sensor, NullGpioOutput,
    NullI2cTempSensor, TempStatus,
};
use abyss_spectro_core::settings::SharedTimeOffset;
use abyss_spectro_core::{SpectrometerSettings, SystemFlags};

use crate::renderer::{EguiSpectralRenderer, SpectralRenderer};
use crate::screen::{ButtonPress, ScreenState, SpectrometerScreen};
use crate::shared::{CommandSender, ResultReceiver, SaveSender};
use crate::theme::ThemeConfig;

/// Command queue depth. The UI never wants commands dropped.
const COMMAND_QUEUE_DEPTH: usize = 32;
/// Result queue depth before the worker starts dropping the oldest entry.
const RESULT_QUEUE_DEPTH: usize = 8;
/// Save queue depth and the UI's block-with-timeout budget on overflow.
const SAVE_QUEUE_DEPTH: usize = 16;
const SAVE_ENQUEUE_TIMEOUT: Duration = Duration::from_millis(500);
/// Bounded join wait for each worker thread on shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Main application state, owning every channel endpoint the UI thread holds
/// and the join handles for the three worker threads.
pub struct SpectroApp {
    cmd_tx: CommandSender,
    result_rx: ResultReceiver,
    save_tx: SaveSender,
    save_forward_rx: crossbeam_channel::Receiver<abyss_spectro_core::SaveRequest>,
    writer_save_tx: SaveSender,
    flags: SystemFlags,
    time: SharedTimeOffset,

    screen: SpectrometerScreen,
    renderer: EguiSpectralRenderer,

    save_error_flag: SaveErrorFlag,
    temp_status: TempStatus,
    fan_threshold: FanThreshold,
    /// Last references the engine echoed back, used to persist calibration
    /// across a restart without the UI ever reaching into the
    /// engine's live state.
    last_references: References,

    leak_since: Option<Instant>,
    shutting_down: bool,

    settings_panel_open: bool,

    engine_handle: Option<std::thread::JoinHandle<()>>,
    writer_handle: Option<std::thread::JoinHandle<()>>,
    temp_handle: Option<std::thread::JoinHandle<()>>,
}

impl SpectroApp {
    pub fn new(cc: &eframe::CreationContext<'_>) -> Self {
        let theme = ThemeConfig::default();
        cc.egui_ctx.set_visuals(theme.to_visuals());

        let config = persistence::load_config().unwrap_or_else(|e| {
            warn!("failed to load persisted config, using defaults: {e}");
            AppConfig::default()
        });

        let data_dir = persistence::default_data_dir().unwrap_or_else(|e| {
            warn!("failed to resolve data directory, using ./spectra_data: {e}");
            std::path::PathBuf::from("spectra_data")
        });

        let flags = SystemFlags::new();
        let time = SharedTimeOffset::new();

        let (cmd_tx, cmd_rx) = bounded::<Command>(COMMAND_QUEUE_DEPTH);
        let (result_tx, result_rx) = bounded(RESULT_QUEUE_DEPTH);
        // The screen state machine only knows how to `send()` on an unbounded
        // queue; the UI thread forwards each request onto the bounded,
        // block-with-timeout queue the data writer actually consumes so a
        // stalled writer can never stall button handling.
        let (save_tx, save_forward_rx) = unbounded();
        let (writer_save_tx, save_rx) = bounded(SAVE_QUEUE_DEPTH);

        let mut references = References::new();
        if let Some(dark) = &config.dark_reference {
            references.set_dark(dark.intensities.clone(), dark.integration_time_ms);
        }
        if let Some(white) = &config.white_reference {
            references.set_white(white.intensities.clone(), white.integration_time_ms);
        }

        let device = match device::discover() {
            Ok(d) => {
                info!("spectrometer discovered at startup");
                d
            }
            Err(e) => {
                warn!("no spectrometer found at startup: {e}");
                Box::new(NullSpectrometer)
            }
        };

        let last_references = references.clone();
        let engine_handle = Some(acquisition::spawn(
            device,
            cmd_rx,
            result_tx,
            flags.clone(),
            time.clone(),
            config.settings,
            references,
        ));

        let save_error_flag = SaveErrorFlag::new();
        let writer_handle = Some(persistence::spawn(
            data_dir,
            save_rx,
            flags.clone(),
            save_error_flag.clone(),
        ));

        let fan_threshold = FanThreshold::new();
        fan_threshold.set(config.fan_threshold_c);
        let temp_status = TempStatus::new();

        let sensor: Box<dyn safety::I2cTempSensor + Send> =
            match Mcp9808Sensor::new(safety_limits::I2C_BUS_PATH, safety_limits::MCP9808_I2C_ADDRESS) {
                Ok(s) => Box::new(s),
                Err(e) => {
                    warn!("temperature sensor bus unavailable, running without it: {e}");
                    Box::new(NullI2cTempSensor)
                }
            };
        let fan: Box<dyn safety::GpioOutput + Send> =
            match CdevGpioOutput::new(safety_limits::GPIO_CHIP_PATH, safety_limits::FAN_ENABLE_PIN) {
                Ok(f) => Box::new(f),
                Err(e) => {
                    warn!("fan GPIO line unavailable, running without it: {e}");
                    Box::new(NullGpioOutput)
                }
            };
        let temp_handle = Some(safety::spawn_temperature_loop(
            sensor,
            fan,
            fan_threshold.clone(),
            temp_status.clone(),
            flags.clone(),
        ));

        let leak_gpio = Box::new(CdevGpioInput::new(
            safety_limits::GPIO_CHIP_PATH,
            safety_limits::LEAK_SENSOR_PIN,
        ));
        if let Err(e) = safety::install_leak_detector(leak_gpio, flags.clone()) {
            warn!("leak sensor unavailable, leak detection disabled: {e}");
        }

        let screen = SpectrometerScreen::new(config.settings, config.settings.lens_type);

        Self {
            cmd_tx,
            result_rx,
            save_tx,
            save_forward_rx,
            writer_save_tx,
            flags,
            time,
            screen,
            renderer: EguiSpectralRenderer::new(),
            save_error_flag,
            temp_status,
            fan_threshold,
            last_references,
            leak_since: None,
            shutting_down: false,
            settings_panel_open: false,
            engine_handle,
            writer_handle,
            temp_handle,
        }
    }

    /// Maps keyboard input to the four logical buttons. GPIO input on a
    /// real deployment produces the same `ButtonPress` values through a
    /// separate debounced source; the UI state machine doesn't distinguish.
    fn poll_keyboard(&mut self, ctx: &egui::Context) {
        let button = ctx.input(|i| {
            if i.key_pressed(egui::Key::ArrowUp) || i.key_pressed(egui::Key::W) {
                Some(ButtonPress::Up)
            } else if i.key_pressed(egui::Key::ArrowDown) || i.key_pressed(egui::Key::S) {
                Some(ButtonPress::Down)
            } else if i.key_pressed(egui::Key::Enter) {
                Some(ButtonPress::Enter)
            } else if i.key_pressed(egui::Key::Backspace) || i.key_pressed(egui::Key::Escape) {
                Some(ButtonPress::Back)
            } else {
                None
            }
        });
        if let Some(button) = button {
            self.screen.handle_input(button, &self.cmd_tx, &self.save_tx);
        }
    }

    fn drain_engine_events(&mut self) {
        while let Ok(event) = self.result_rx.try_recv() {
            match event {
                EngineEvent::References(refs) => self.last_references = refs,
                other => self.screen.process_event(other, &self.cmd_tx),
            }
        }
    }

    /// Gives the acquisition engine thread a brief window to echo back its
    /// final references after the shutdown flag is set, so a freshly
    /// captured dark/white reference survives a restart. The engine
    /// sends this exactly once, right before it closes the device.
    fn await_final_references(&mut self) {
        let deadline = Instant::now() + Duration::from_millis(500);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.result_rx.recv_timeout(remaining) {
                Ok(EngineEvent::References(refs)) => {
                    self.last_references = refs;
                    break;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    /// Forwards every save request the screen enqueued this frame onto the
    /// writer's bounded queue, blocking up to `SAVE_ENQUEUE_TIMEOUT` per
    /// request and setting `save_error_flag` on overflow.
    fn forward_save_requests(&mut self) {
        while let Ok(request) = self.save_forward_rx.try_recv() {
            persistence::send_with_timeout(
                &self.writer_save_tx,
                request,
                SAVE_ENQUEUE_TIMEOUT,
                &self.save_error_flag,
            );
        }
    }

    /// Latch a hold timer on the first observed leak, begin shutdown
    /// once it has been held 5 seconds.
    fn poll_leak(&mut self, ctx: &egui::Context) {
        if self.flags.leak_detected.is_set() {
            let since = *self.leak_since.get_or_insert_with(Instant::now);
            if since.elapsed() >= Duration::from_secs(safety_limits::LEAK_WARNING_HOLD_S) && !self.shutting_down {
                self.begin_shutdown(ctx);
            }
        }
    }

    /// "Leak detected": switch to the warning screen, hold, then request
    /// shutdown. The window-close and SIGINT/SIGTERM paths are handled by
    /// `on_exit`, which eframe calls regardless of how the run loop ends.
    fn begin_shutdown(&mut self, ctx: &egui::Context) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.flags.shutdown.set();
        self.await_final_references();
        self.persist_config();
        ctx.send_viewport_cmd(egui::ViewportCommand::Close);
    }

    fn persist_config(&self) {
        let config = AppConfig {
            settings: *self.screen.settings(),
            fan_threshold_c: self.fan_threshold.get(),
            dark_reference: self.last_references.dark.clone(),
            white_reference: self.last_references.white.clone(),
        };
        if let Err(e) = persistence::save_config(&config) {
            warn!("failed to persist config on shutdown: {e}");
        }
    }

    fn apply_settings(&mut self, mut settings: SpectrometerSettings) {
        settings.integration_time_ms = SpectrometerSettings::clamp_integration_time_ms(settings.integration_time_ms);
        settings.scans_to_average = SpectrometerSettings::clamp_scans_to_average(settings.scans_to_average);
        self.screen.set_lens_type(settings.lens_type);
        self.screen.apply_settings(settings, &self.cmd_tx);
    }

    fn draw_settings_panel(&mut self, ctx: &egui::Context) {
        let mut settings = *self.screen.settings();
        let mut changed = false;
        let mut fan_threshold = self.fan_threshold.get();

        egui::Window::new("Settings")
            .open(&mut self.settings_panel_open)
            .resizable(false)
            .show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.label("Integration time (ms)");
                    if ui
                        .add(egui::Slider::new(
                            &mut settings.integration_time_ms,
                            abyss_spectro_core::limits::spectrometer::MIN_INTEGRATION_TIME_MS
                                ..=abyss_spectro_core::limits::spectrometer::MAX_INTEGRATION_TIME_MS,
                        ))
                        .changed()
                    {
                        changed = true;
                    }
                });
                ui.horizontal(|ui| {
                    ui.label("Scans to average");
                    if ui
                        .add(egui::Slider::new(
                            &mut settings.scans_to_average,
                            abyss_spectro_core::limits::spectrometer::MIN_SCANS_TO_AVERAGE
                                ..=abyss_spectro_core::limits::spectrometer::MAX_SCANS_TO_AVERAGE,
                        ))
                        .changed()
                    {
                        changed = true;
                    }
                });
                ui.horizontal(|ui| {
                    ui.label("Collection mode");
                    egui::ComboBox::from_id_salt("collection_mode")
                        .selected_text(match settings.collection_mode {
                            abyss_spectro_core::CollectionMode::Raw => "RAW",
                            abyss_spectro_core::CollectionMode::Reflectance => "REFLECTANCE",
                        })
                        .show_ui(ui, |ui| {
                            changed |= ui
                                .selectable_value(
                                    &mut settings.collection_mode,
                                    abyss_spectro_core::CollectionMode::Raw,
                                    "RAW",
                                )
                                .changed();
                            changed |= ui
                                .selectable_value(
                                    &mut settings.collection_mode,
                                    abyss_spectro_core::CollectionMode::Reflectance,
                                    "REFLECTANCE",
                                )
                                .changed();
                        });
                });
                ui.horizontal(|ui| {
                    ui.label("Lens");
                    egui::ComboBox::from_id_salt("lens_type")
                        .selected_text(settings.lens_type.as_str())
                        .show_ui(ui, |ui| {
                            for lens in [
                                abyss_spectro_core::LensType::Fiber,
                                abyss_spectro_core::LensType::Cable,
                                abyss_spectro_core::LensType::FiberCable,
                            ] {
                                changed |= ui
                                    .selectable_value(&mut settings.lens_type, lens, lens.as_str())
                                    .changed();
                            }
                        });
                });

                ui.separator();
                ui.horizontal(|ui| {
                    ui.label("Fan threshold (°C, 0 = always on)");
                    if ui
                        .add(egui::Slider::new(
                            &mut fan_threshold,
                            safety_limits::FAN_THRESHOLD_MIN_C..=safety_limits::FAN_THRESHOLD_MAX_C,
                        ))
                        .changed()
                    {
                        self.fan_threshold.set(fan_threshold);
                    }
                });

                let (temp_c, sensor_available, fan_on) = self.temp_status.snapshot();
                ui.label(match temp_c {
                    Some(t) if sensor_available => format!("Enclosure temp: {t:.1} °C (fan {})", if fan_on { "on" } else { "off" }),
                    _ => "Enclosure temp: N/A".to_string(),
                });

                if self.save_error_flag.take() {
                    let color = crate::theme::error_color(&ctx.style().visuals);
                    ui.colored_label(color, "Save queue overflow: a recent sample was not written to disk");
                }

                ui.separator();
                ui.label(format!(
                    "Device time: {}",
                    self.time.now().format("%Y-%m-%d %H:%M:%S UTC")
                ));
                if ui.button("Reset time offset").clicked() {
                    self.time.begin_edit(Duration::ZERO, false);
                    self.time.commit();
                }
            });

        if changed {
            self.apply_settings(settings);
        }
    }

    fn draw_leak_overlay(&self, ctx: &egui::Context) {
        egui::CentralPanel::default()
            .frame(egui::Frame::none().fill(egui::Color32::from_rgb(180, 0, 0)))
            .show(ctx, |ui| {
                ui.centered_and_justified(|ui| {
                    ui.heading(
                        egui::RichText::new("CRITICAL: LEAK DETECTED")
                            .color(egui::Color32::WHITE)
                            .size(36.0),
                    );
                });
            });
    }

    fn draw_main(&mut self, ctx: &egui::Context) {
        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("Abyss Spectrometer");
                ui.separator();
                ui.label(format!("{:?}", self.screen.state()));
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    if ui.button("Settings").clicked() {
                        self.settings_panel_open = !self.settings_panel_open;
                    }
                });
            });
        });

        if let Some(banner) = self.screen.banner().cloned() {
            egui::TopBottomPanel::top("banner").show(ctx, |ui| {
                let visuals = &ctx.style().visuals;
                let color = if banner.is_error {
                    crate::theme::error_color(visuals)
                } else {
                    crate::theme::warning_color(visuals)
                };
                ui.colored_label(color, &banner.message);
            });
        }

        egui::SidePanel::left("calibration_panel")
            .resizable(false)
            .default_width(220.0)
            .show(ctx, |ui| {
                let status = self.screen.calibration_status();
                ui.label("Calibration");
                ui.label(format!(
                    "Dark: {}",
                    if status.has_dark_ref { "captured" } else { "none" }
                ));
                ui.label(format!(
                    "White: {}",
                    if status.has_white_ref { "captured" } else { "none" }
                ));
                ui.label(format!(
                    "Auto-integration: {}",
                    if status.auto_integ_completed { "done" } else { "not run" }
                ));

                if self.screen.state() == ScreenState::AutoIntegConfirm {
                    if let Some((ms, label)) = self.screen.auto_integ_proposal() {
                        ui.separator();
                        ui.label(format!("Proposed: {ms} ms ({label})"));
                    }
                }

                ui.separator();
                ui.label("UP/DOWN/ENTER/BACK navigate this screen.");
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            let (y_min, y_max) = self.screen.y_limits();
            self.renderer.set_y_limits(y_min, y_max);

            let scan = match self.screen.state() {
                ScreenState::Frozen
                | ScreenState::FrozenDarkRef
                | ScreenState::FrozenWhiteRef => self.screen.frozen_scan(),
                _ => self.screen.live_scan(),
            };

            if let Some(scan) = scan {
                self.renderer.set_wavelengths(&scan.wavelengths);
                self.renderer.update_spectrum(
                    &scan.intensities,
                    abyss_spectro_core::limits::plotting::USE_LIVE_SMOOTHING,
                );
            }

            self.renderer.draw(ui);
        });
    }

    fn join_workers(&mut self) {
        for handle in [self.engine_handle.take(), self.writer_handle.take(), self.temp_handle.take()]
            .into_iter()
            .flatten()
        {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            let deadline = Instant::now() + JOIN_TIMEOUT;
            // `JoinHandle::join` has no timeout; the threads themselves poll
            // the shutdown flag on a short interval, so in practice this
            // returns well inside the deadline. We still record an overrun.
            if handle.join().is_err() {
                warn!("{name} thread panicked during shutdown");
            }
            if Instant::now() > deadline {
                warn!("{name} thread join exceeded its timeout budget");
            }
        }
    }
}

impl eframe::App for SpectroApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.drain_engine_events();
        self.forward_save_requests();
        self.poll_leak(ctx);

        let (temp_c, _sensor_available, _fan_on) = self.temp_status.snapshot();
        self.screen.set_temperature(temp_c);

        if self.flags.leak_detected.is_set() {
            self.draw_leak_overlay(ctx);
        } else {
            self.poll_keyboard(ctx);
            self.draw_main(ctx);
            if self.settings_panel_open {
                self.draw_settings_panel(ctx);
            }
        }

        ctx.request_repaint_after(Duration::from_millis(
            abyss_spectro_core::limits::timing::MAIN_LOOP_DELAY_MS,
        ));
    }

    fn on_exit(&mut self, _gl: Option<&eframe::glow::Context>) {
        self.flags.shutdown.set();
        self.await_final_references();
        self.persist_config();
        self.join_workers();
        info!("abyss-spectro exited cleanly");
    }
}
