//! Leak detection and temperature/fan control.
//!
//! Two independent concerns share this module because both are "safety"
//! actors in the system design: an interrupt-driven leak sensor that
//! latches a process-wide flag, and a periodic I2C temperature read that
//! drives a fan GPIO off a menu-adjustable threshold.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};

use crate::error::{Result, SpectroError};
use crate::flags::SystemFlags;
use crate::limits::safety as limits;

/// A GPIO line configured as an input, with interrupt-driven falling-edge
/// detection. Implementations run the callback on their own thread;
/// `on_falling_edge` returns once registration succeeds, it does not block.
pub trait GpioInput {
    fn on_falling_edge(
        &mut self,
        callback: Box<dyn Fn() + Send>,
        debounce_ms: u32,
    ) -> Result<()>;
}

/// A GPIO line configured as an output.
pub trait GpioOutput {
    fn set_high(&mut self) -> Result<()>;
    fn set_low(&mut self) -> Result<()>;
}

/// An I2C temperature sensor, MCP9808-class.
pub trait I2cTempSensor {
    fn read_temperature_c(&mut self) -> Result<f64>;
    /// Verifies manufacturer + device id before the caller trusts readings.
    fn verify_identity(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// gpio-cdev backed implementations
// ---------------------------------------------------------------------------

/// `GpioInput` backed by `gpio-cdev`, configured with a pull-up and
/// falling-edge event requests.
pub struct CdevGpioInput {
    chip_path: String,
    pin: u32,
}

impl CdevGpioInput {
    pub fn new(chip_path: impl Into<String>, pin: u32) -> Self {
        Self {
            chip_path: chip_path.into(),
            pin,
        }
    }
}

impl GpioInput for CdevGpioInput {
    /// Spawns a thread that blocks on the line's event stream and invokes
    /// `callback` on each falling edge that clears the software debounce
    /// window. `gpio-cdev`'s kernel-side `EventRequestFlags` provide the
    /// hardware debounce; the software check here guards
    /// against any residual chatter.
    fn on_falling_edge(
        &mut self,
        callback: Box<dyn Fn() + Send>,
        debounce_ms: u32,
    ) -> Result<()> {
        use gpio_cdev::{Chip, EventRequestFlags, LineEventHandle, LineRequestFlags};

        let mut chip = Chip::new(&self.chip_path)
            .map_err(|e| SpectroError::Gpio(format!("open {}: {e}", self.chip_path)))?;
        let line = chip
            .get_line(self.pin)
            .map_err(|e| SpectroError::Gpio(format!("get line {}: {e}", self.pin)))?;
        // The sensor is wired with an external pull-up; we only need the
        // kernel to treat the line as an input.
        let events: LineEventHandle = line
            .events(
                LineRequestFlags::INPUT,
                EventRequestFlags::FALLING_EDGE,
                "abyss-leak-sensor",
            )
            .map_err(|e| SpectroError::Gpio(format!("request events on {}: {e}", self.pin)))?;

        std::thread::Builder::new()
            .name("leak-sensor-isr".into())
            .spawn(move || {
                let debounce = Duration::from_millis(debounce_ms as u64);
                let mut last_fire = std::time::Instant::now() - debounce;
                for event in events {
                    if event.is_err() {
                        break;
                    }
                    let now = std::time::Instant::now();
                    if now.duration_since(last_fire) < debounce {
                        continue;
                    }
                    last_fire = now;
                    error!("WATER LEAK DETECTED");
                    callback();
                }
            })
            .map_err(|e| SpectroError::Gpio(format!("spawn leak-sensor-isr: {e}")))?;
        Ok(())
    }
}

/// `GpioOutput` backed by `gpio-cdev`, used for the fan enable line.
pub struct CdevGpioOutput {
    handle: gpio_cdev::LineHandle,
}

impl CdevGpioOutput {
    pub fn new(chip_path: &str, pin: u32) -> Result<Self> {
        use gpio_cdev::{Chip, LineRequestFlags};
        let mut chip =
            Chip::new(chip_path).map_err(|e| SpectroError::Gpio(format!("open {chip_path}: {e}")))?;
        let line = chip
            .get_line(pin)
            .map_err(|e| SpectroError::Gpio(format!("get line {pin}: {e}")))?;
        let handle = line
            .request(LineRequestFlags::OUTPUT, 0, "abyss-fan")
            .map_err(|e| SpectroError::Gpio(format!("request output on {pin}: {e}")))?;
        Ok(Self { handle })
    }
}

impl GpioOutput for CdevGpioOutput {
    fn set_high(&mut self) -> Result<()> {
        self.handle
            .set_value(1)
            .map_err(|e| SpectroError::Gpio(format!("set high: {e}")))
    }

    fn set_low(&mut self) -> Result<()> {
        self.handle
            .set_value(0)
            .map_err(|e| SpectroError::Gpio(format!("set low: {e}")))
    }
}

/// `I2cTempSensor` for the MCP9808, backed by `linux-embedded-hal`'s `I2cdev`.
pub struct Mcp9808Sensor {
    bus: linux_embedded_hal::I2cdev,
    address: u8,
}

const REG_MANUF_ID: u8 = 0x06;
const REG_DEVICE_ID: u8 = 0x07;
const REG_AMBIENT_TEMP: u8 = 0x05;
const MCP9808_MANUFACTURER_ID: u16 = 0x0054;
const MCP9808_DEVICE_ID: u8 = 0x04;

impl Mcp9808Sensor {
    pub fn new(bus_path: &str, address: u8) -> Result<Self> {
        let bus = linux_embedded_hal::I2cdev::new(bus_path)
            .map_err(|e| SpectroError::I2c(format!("open {bus_path}: {e}")))?;
        Ok(Self { bus, address })
    }

    fn read_register(&mut self, register: u8, len: usize) -> Result<Vec<u8>> {
        use embedded_hal::i2c::I2c;
        let mut buf = vec![0u8; len];
        self.bus
            .write_read(self.address, &[register], &mut buf)
            .map_err(|e| SpectroError::I2c(format!("read register {register:#x}: {e:?}")))?;
        Ok(buf)
    }
}

impl I2cTempSensor for Mcp9808Sensor {
    fn verify_identity(&mut self) -> Result<()> {
        let manuf = self.read_register(REG_MANUF_ID, 2)?;
        let manuf_id = u16::from_be_bytes([manuf[0], manuf[1]]);
        let dev = self.read_register(REG_DEVICE_ID, 2)?;
        let device_id = dev[0];
        if manuf_id != MCP9808_MANUFACTURER_ID || device_id != MCP9808_DEVICE_ID {
            return Err(SpectroError::I2c(format!(
                "unexpected MCP9808 identity: manufacturer={manuf_id:#06x} device={device_id:#04x}"
            )));
        }
        Ok(())
    }

    fn read_temperature_c(&mut self) -> Result<f64> {
        let raw = self.read_register(REG_AMBIENT_TEMP, 2)?;
        let mut value = ((raw[0] as u16 & 0x1f) << 8) | raw[1] as u16;
        let mut temp = (value & 0x0fff) as f64 / 16.0;
        if value & 0x1000 != 0 {
            value &= 0x0fff;
            temp = (value as f64 / 16.0) - 256.0;
        }
        Ok(temp)
    }
}

// ---------------------------------------------------------------------------
// Menu-adjustable fan threshold
// ---------------------------------------------------------------------------

/// Fan threshold in Celsius, shared between the menu (writer) and the
/// temperature loop (reader). Value 0 means "always on".
#[derive(Clone)]
pub struct FanThreshold(Arc<AtomicI32>);

impl FanThreshold {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI32::new(limits::FAN_DEFAULT_THRESHOLD_C)))
    }

    pub fn get(&self) -> i32 {
        self.0.load(Ordering::SeqCst)
    }

    /// Clamp to `[0, 60]` and align to 5 °C steps.
    pub fn clamp(value: i32) -> i32 {
        let clamped = value.clamp(limits::FAN_THRESHOLD_MIN_C, limits::FAN_THRESHOLD_MAX_C);
        (clamped / limits::FAN_THRESHOLD_STEP_C) * limits::FAN_THRESHOLD_STEP_C
    }

    pub fn set(&self, value: i32) {
        self.0.store(Self::clamp(value), Ordering::SeqCst);
    }
}

impl Default for FanThreshold {
    fn default() -> Self {
        Self::new()
    }
}

/// Temperature sensor observability the UI can poll without touching the
/// sensor itself (mirrors `CalibrationStatus`'s piggyback-snapshot idiom).
#[derive(Clone, Default)]
pub struct TempStatus(Arc<std::sync::Mutex<TempStatusInner>>);

#[derive(Clone, Copy, Default)]
struct TempStatusInner {
    last_good_temp_c: Option<f64>,
    sensor_available: bool,
    fan_on: bool,
}

impl TempStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> (Option<f64>, bool, bool) {
        let inner = self.0.lock().expect("temp status mutex poisoned");
        (inner.last_good_temp_c, inner.sensor_available, inner.fan_on)
    }

    fn update(&self, last_good_temp_c: Option<f64>, sensor_available: bool, fan_on: bool) {
        let mut inner = self.0.lock().expect("temp status mutex poisoned");
        inner.last_good_temp_c = last_good_temp_c;
        inner.sensor_available = sensor_available;
        inner.fan_on = fan_on;
    }
}

/// Spawns the periodic temperature-read / fan-control loop on its own
/// thread. Init retries up to `TEMP_INIT_RETRY_COUNT` times before giving
/// up on the sensor entirely; a sensor that initializes but later exceeds
/// `TEMP_MAX_CONSECUTIVE_FAILURES` consecutive read failures is marked
/// permanently unavailable so the console isn't spammed.
pub fn spawn_temperature_loop(
    mut sensor: Box<dyn I2cTempSensor + Send>,
    mut fan: Box<dyn GpioOutput + Send>,
    threshold: FanThreshold,
    status: TempStatus,
    flags: SystemFlags,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("temp-fan-loop".into())
        .spawn(move || {
            let mut sensor_available = false;
            for attempt in 0..limits::TEMP_INIT_RETRY_COUNT {
                if flags.shutdown.is_set() {
                    return;
                }
                match sensor.verify_identity() {
                    Ok(()) => {
                        sensor_available = true;
                        break;
                    }
                    Err(e) => {
                        warn!("temp sensor init attempt {}/{} failed: {e}", attempt + 1, limits::TEMP_INIT_RETRY_COUNT);
                        std::thread::sleep(Duration::from_secs(limits::TEMP_INIT_RETRY_DELAY_S));
                    }
                }
            }
            if !sensor_available {
                warn!("temperature sensor unavailable after {} attempts; reporting N/A", limits::TEMP_INIT_RETRY_COUNT);
            }

            let mut consecutive_failures: u32 = 0;
            let mut last_good_temp: Option<f64> = None;
            let mut gave_up = !sensor_available;
            // Carried across iterations: a failed read retains this rather
            // than recomputing from a possibly-stale last_good_temp.
            let mut fan_on = false;

            loop {
                if flags.shutdown.is_set() {
                    break;
                }

                let threshold_c = threshold.get();

                if sensor_available && !gave_up {
                    match sensor.read_temperature_c() {
                        Ok(temp) => {
                            consecutive_failures = 0;
                            last_good_temp = Some(temp);
                            fan_on = temp >= threshold_c as f64;
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures == 1 {
                                warn!("temperature read failed: {e}");
                            }
                            if consecutive_failures >= limits::TEMP_MAX_CONSECUTIVE_FAILURES {
                                gave_up = true;
                                warn!(
                                    "temperature sensor exceeded {} consecutive failures; marking unavailable",
                                    limits::TEMP_MAX_CONSECUTIVE_FAILURES
                                );
                            }
                            // threshold <= 0 always wins; otherwise a failed
                            // read leaves the fan in whatever state the last
                            // successful read put it in.
                            if threshold_c <= 0 {
                                fan_on = true;
                            }
                        }
                    }
                } else {
                    // No sensor at all: fail safe to "always on" only if the
                    // operator explicitly asked for that via threshold <= 0,
                    // otherwise retain whatever state the fan was last set to.
                    if threshold_c <= 0 {
                        fan_on = true;
                    }
                }

                if let Err(e) = if fan_on { fan.set_high() } else { fan.set_low() } {
                    warn!("fan GPIO write failed: {e}");
                }
                status.update(last_good_temp, sensor_available && !gave_up, fan_on);

                sleep_respecting_shutdown(Duration::from_secs(limits::TEMP_UPDATE_INTERVAL_S), &flags);
            }
            info!("temp-fan-loop thread exiting");
        })
        .expect("failed to spawn temp-fan-loop thread")
}

/// Sleeps for `total`, but in short slices so a shutdown request lands
/// within one slice instead of waiting out the whole interval.
fn sleep_respecting_shutdown(total: Duration, flags: &SystemFlags) {
    const SLICE: Duration = Duration::from_millis(200);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if flags.shutdown.is_set() {
            return;
        }
        let slice = remaining.min(SLICE);
        std::thread::sleep(slice);
        remaining -= slice;
    }
}

/// Registers the leak interrupt; on trigger, latches `flags.leak_detected`
/// (edge-triggered, latching, no polling loop).
pub fn install_leak_detector(
    mut gpio: Box<dyn GpioInput + Send>,
    flags: SystemFlags,
) -> Result<()> {
    gpio.on_falling_edge(
        Box::new(move || flags.leak_detected.set()),
        limits::LEAK_DEBOUNCE_MS,
    )
}

// ---------------------------------------------------------------------------
// Fallbacks for environments without the real GPIO/I2C hardware
// ---------------------------------------------------------------------------

/// A fan output that drives nothing. Used when the host has no
/// `gpio-cdev`-reachable fan line (e.g. running the controller off-target
/// during development); the temperature loop still runs its full retry and
/// failure-accounting logic against it.
#[derive(Default)]
pub struct NullGpioOutput;

impl GpioOutput for NullGpioOutput {
    fn set_high(&mut self) -> Result<()> {
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A temperature sensor that is never present. `verify_identity` always
/// fails, so the init-retry loop exhausts its attempts and the loop
/// reports the sensor permanently unavailable, exactly as it would for a
/// disconnected real MCP9808.
#[derive(Default)]
pub struct NullI2cTempSensor;

impl I2cTempSensor for NullI2cTempSensor {
    fn read_temperature_c(&mut self) -> Result<f64> {
        Err(SpectroError::I2c("no temperature sensor present".into()))
    }

    fn verify_identity(&mut self) -> Result<()> {
        Err(SpectroError::I2c("no temperature sensor present".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct StubGpioInput {
        fired: Arc<AtomicU32>,
    }

    impl GpioInput for StubGpioInput {
        fn on_falling_edge(&mut self, callback: Box<dyn Fn() + Send>, _debounce_ms: u32) -> Result<()> {
            let fired = self.fired.clone();
            fired.fetch_add(1, Ordering::SeqCst);
            callback();
            Ok(())
        }
    }

    #[test]
    fn leak_detector_latches_flag_on_trigger() {
        let flags = SystemFlags::new();
        let gpio = StubGpioInput {
            fired: Arc::new(AtomicU32::new(0)),
        };
        install_leak_detector(Box::new(gpio), flags.clone()).unwrap();
        assert!(flags.leak_detected.is_set());
    }

    #[test]
    fn fan_threshold_clamps_and_aligns_to_step() {
        assert_eq!(FanThreshold::clamp(-5), 0);
        assert_eq!(FanThreshold::clamp(100), 60);
        assert_eq!(FanThreshold::clamp(23), 20);
    }

    #[test]
    fn fan_threshold_clamp_is_idempotent() {
        for raw in [-10, 0, 7, 23, 60, 99] {
            let once = FanThreshold::clamp(raw);
            let twice = FanThreshold::clamp(once);
            assert_eq!(once, twice);
        }
    }

    struct StubSensor {
        readings: std::collections::VecDeque<Result<f64>>,
    }

    impl I2cTempSensor for StubSensor {
        fn verify_identity(&mut self) -> Result<()> {
            Ok(())
        }
        fn read_temperature_c(&mut self) -> Result<f64> {
            self.readings
                .pop_front()
                .unwrap_or_else(|| Err(SpectroError::I2c("exhausted".into())))
        }
    }

    struct StubFan {
        high: Arc<std::sync::atomic::AtomicBool>,
    }

    impl GpioOutput for StubFan {
        fn set_high(&mut self) -> Result<()> {
            self.high.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn set_low(&mut self) -> Result<()> {
            self.high.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn temperature_loop_drives_fan_from_threshold() {
        let flags = SystemFlags::new();
        let threshold = FanThreshold::new();
        threshold.set(25);
        let status = TempStatus::new();
        let high = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let sensor = StubSensor {
            readings: std::collections::VecDeque::from(vec![Ok(30.0)]),
        };
        let fan = StubFan { high: high.clone() };

        let flags_for_loop = flags.clone();
        let handle = spawn_temperature_loop(
            Box::new(sensor),
            Box::new(fan),
            threshold,
            status.clone(),
            flags_for_loop,
        );
        std::thread::sleep(Duration::from_millis(200));
        flags.shutdown.set();
        handle.join().unwrap();

        assert!(high.load(Ordering::SeqCst));
        let (last_good, available, fan_on) = status.snapshot();
        assert_eq!(last_good, Some(30.0));
        assert!(available);
        assert!(fan_on);
    }
}
