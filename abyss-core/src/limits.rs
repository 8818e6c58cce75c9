//! Compiled-in constants for the instrument, grouped into small structs by
//! subsystem instead of one flat namespace. Values that the operator menu
//! can change at runtime (wavelength display window, fan threshold, time
//! offset) live as ordinary fields seeded from these constants, not as
//! consts themselves.

/// Integration time and scan-averaging limits, in the units the menu and the
/// hardware each expect.
pub mod spectrometer {
    pub const DEFAULT_INTEGRATION_TIME_MS: u32 = 1000;
    pub const MIN_INTEGRATION_TIME_MS: u32 = 100;
    pub const MAX_INTEGRATION_TIME_MS: u32 = 6000;
    pub const INTEGRATION_TIME_STEP_MS: u32 = 50;

    /// Device-reported defaults; `Spectrometer::integration_limits_us` always
    /// wins over these when it disagrees.
    pub const HW_INTEGRATION_TIME_MIN_US: u32 = 3_800;
    pub const HW_INTEGRATION_TIME_MAX_US: u32 = 6_000_000;
    pub const HW_INTEGRATION_TIME_BASE_US: u32 = 10;
    pub const HW_MAX_ADC_COUNT: f64 = 16383.0;

    pub const DEFAULT_SCANS_TO_AVERAGE: u32 = 1;
    pub const MIN_SCANS_TO_AVERAGE: u32 = 0;
    pub const MAX_SCANS_TO_AVERAGE: u32 = 50;
    pub const SCANS_TO_AVERAGE_STEP: u32 = 1;

    /// Tolerance below which a reflectance denominator is treated as zero.
    pub const DIVISION_EPSILON: f64 = 1e-9;
}

/// Auto-integration proportional-control tuning.
pub mod auto_integration {
    use super::spectrometer::HW_INTEGRATION_TIME_BASE_US;

    pub const TARGET_LOW_PERCENT: f64 = 80.0;
    pub const TARGET_HIGH_PERCENT: f64 = 95.0;
    pub const MAX_ITERATIONS: u32 = 20;
    pub const PROPORTIONAL_GAIN: f64 = 0.8;
    pub const MIN_ADJUSTMENT_US: f64 = (HW_INTEGRATION_TIME_BASE_US * 5) as f64;
    pub const OSCILLATION_DAMPING_FACTOR: f64 = 0.5;
}

/// Live-plot decimation, smoothing and Y-axis scaling constants.
pub mod plotting {
    pub const USE_LIVE_SMOOTHING: bool = true;
    pub const LIVE_SMOOTHING_WINDOW_SIZE: usize = 9;
    pub const Y_AXIS_DEFAULT_MAX: f64 = 1000.0;
    pub const Y_AXIS_REFLECTANCE_DEFAULT_MAX: f64 = 10.0;
    pub const Y_AXIS_RESCALE_FACTOR: f64 = 1.2;
    pub const Y_AXIS_MIN_CEILING: f64 = 100.0;
    pub const Y_AXIS_REFLECTANCE_RESCALE_MIN_CEILING: f64 = 0.2;
    pub const Y_AXIS_REFLECTANCE_RESCALE_MAX_CEILING: f64 = 200.0;

    pub const WAVELENGTH_RANGE_MIN_NM: f64 = 400.0;
    pub const WAVELENGTH_RANGE_MAX_NM: f64 = 620.0;
    pub const TARGET_DISPLAY_POINTS: usize = 300;

    pub const WAVELENGTH_EDIT_STEP_NM: f64 = 20.0;
    pub const WAVELENGTH_EDIT_MIN_LIMIT_NM: f64 = 340.0;
    pub const WAVELENGTH_EDIT_MAX_LIMIT_NM: f64 = 850.0;
    pub const WAVELENGTH_EDIT_MIN_GAP_NM: f64 = 40.0;

    /// Ceiling applied to reflectance values before they ever reach the
    /// renderer or the CSV writer.
    pub const Y_REFL_MAX_CEIL: f64 = Y_AXIS_REFLECTANCE_RESCALE_MAX_CEILING;
}

/// Safety supervisor timing and GPIO pin assignments (BCM numbering).
pub mod safety {
    pub const GPIO_CHIP_PATH: &str = "/dev/gpiochip0";
    pub const I2C_BUS_PATH: &str = "/dev/i2c-1";
    pub const MCP9808_I2C_ADDRESS: u8 = 0x18;

    pub const LEAK_SENSOR_PIN: u32 = 26;
    pub const LEAK_DEBOUNCE_MS: u32 = 1_000;
    pub const LEAK_WARNING_HOLD_S: u64 = 5;

    pub const FAN_ENABLE_PIN: u32 = 4;
    pub const FAN_DEFAULT_THRESHOLD_C: i32 = 0;
    pub const FAN_THRESHOLD_MIN_C: i32 = 0;
    pub const FAN_THRESHOLD_MAX_C: i32 = 60;
    pub const FAN_THRESHOLD_STEP_C: i32 = 5;

    pub const TEMP_UPDATE_INTERVAL_S: u64 = 10;
    pub const TEMP_INIT_RETRY_COUNT: u32 = 3;
    pub const TEMP_INIT_RETRY_DELAY_S: u64 = 1;
    pub const TEMP_MAX_CONSECUTIVE_FAILURES: u32 = 5;
}

/// Physical button debounce and main-loop pacing.
pub mod timing {
    pub const BUTTON_DEBOUNCE_MS: u64 = 200;
    pub const MAIN_LOOP_DELAY_MS: u64 = 33;
}

/// Filesystem layout.
pub mod paths {
    pub const DATA_DIR_NAME: &str = "spectra_data";
    pub const CSV_BASE_FILENAME: &str = "spectra_log.csv";
}
