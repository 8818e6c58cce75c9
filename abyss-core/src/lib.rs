//! # abyss-spectro-core
//!
//! Acquisition, calibration and persistence core for the Abyss underwater
//! spectrometer controller.
//!
//! The crate is organized around the concurrent actors of the control
//! application:
//!
//! - [`acquisition`]: the dedicated worker thread that owns the spectrometer
//!   device, runs capture cycles, and stamps results with a session id.
//! - [`calibration`]: dark/white reference storage, the validity predicate,
//!   and the auto-integration proportional-control algorithm.
//! - [`persistence`]: the data writer worker (CSV + PNG) and the JSON
//!   settings/calibration store used across restarts.
//! - [`safety`]: interrupt-driven leak detection and the temperature/fan
//!   control loop.
//! - [`flags`]: the two process-wide latching signals every actor observes.
//!
//! [`device`] and [`transport`] hold the hardware abstraction traits
//! (`Spectrometer`, `Transport`) plus the concrete Ocean-family USB
//! implementation; [`settings`] and [`scan`] hold the shared data model.

pub mod acquisition;
pub mod calibration;
pub mod device;
pub mod error;
pub mod flags;
pub mod limits;
pub mod persistence;
pub mod safety;
pub mod scan;
pub mod settings;
pub mod transport;

pub use calibration::{CalibrationStatus, References};
pub use device::{discover, BoxedSpectrometer, NullSpectrometer, OceanSpectrometer, Spectrometer};
pub use error::{Result, SpectroError};
pub use flags::SystemFlags;
pub use scan::{SaveRequest, ScanResult, SpectraType};
pub use settings::{CollectionMode, LensType, SharedTimeOffset, SpectrometerSettings, TimeOffset};
pub use transport::{Transport, UsbTransport};
