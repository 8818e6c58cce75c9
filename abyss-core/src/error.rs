//! Crate-wide error taxonomy.
//!
//! A single enum distinguishes the failure categories the rest of the crate must
//! tell apart (device absent, transient vs. hard I/O, reference mismatch, disk
//! failures, bad configuration). Actors never propagate this type across a
//! thread boundary — each actor converts it into the domain-level sentinel its
//! queue protocol defines (see `acquisition::EngineEvent::DeviceUnhealthy`,
//! `safety::TempStatus`).

use thiserror::Error;

/// The error type for the underwater spectrometer controller.
#[derive(Error, Debug)]
pub enum SpectroError {
    /// No supported spectrometer was found on the bus.
    #[error("spectrometer not found")]
    DeviceNotFound,

    /// USB communication error.
    #[error("USB communication error: {0}")]
    Usb(#[from] rusb::Error),

    /// The device has exceeded its consecutive-failure threshold and is
    /// being treated as unavailable until the next session start.
    #[error("device unhealthy: {0}")]
    DeviceUnhealthy(String),

    /// A reflectance capture was requested but the named reference is
    /// missing or was captured at a different integration time.
    #[error("reference missing or stale: {which}")]
    ReferenceMissing {
        /// Which reference is the problem ("dark" or "white").
        which: &'static str,
    },

    /// GPIO configuration or read/write failure.
    #[error("GPIO error: {0}")]
    Gpio(String),

    /// I2C bus or sensor-identity failure.
    #[error("I2C error: {0}")]
    I2c(String),

    /// Filesystem failure while persisting scans or settings.
    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// CSV encode/write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON (settings/calibration) encode or decode failure.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// A specialized [`Result`] type used throughout the crate.
pub type Result<T> = std::result::Result<T, SpectroError>;
