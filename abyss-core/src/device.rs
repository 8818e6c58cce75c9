//! The `Spectrometer` trait and a generic Ocean-family USB implementation.

use std::time::Duration;

use rusb::{Context, UsbContext};

use crate::error::{Result, SpectroError};
use crate::transport::{Transport, UsbTransport};

/// Hardware abstraction the acquisition engine consumes. Exclusively owned by
/// the engine: opened on engine start, closed on shutdown.
pub trait Spectrometer {
    fn open(&mut self) -> Result<()>;
    fn close(&mut self);
    fn wavelengths(&self) -> &[f64];
    fn set_integration_time_us(&mut self, us: u32) -> Result<()>;
    fn read_intensities(&mut self) -> Result<Vec<f64>>;
    /// Device-reported integration limits in microseconds; these always take
    /// precedence over the compiled-in defaults.
    fn integration_limits_us(&self) -> (u32, u32);
}

/// A `Spectrometer` usable across threads.
pub type BoxedSpectrometer = Box<dyn Spectrometer + Send>;

const CMD_GET_WAVELENGTH_TABLE: u8 = 0x01;
const CMD_SET_INTEGRATION_TIME: u8 = 0x02;
const CMD_TRIGGER_AND_READ: u8 = 0x03;
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const INTERRUPT_ENDPOINT: u8 = 0x81;
const PIXEL_COUNT: usize = 256;

/// Generic driver for the "Ocean-family" USB spectrometer family this
/// controller supports (one device family, no others). Speaks a small vendor
/// control-transfer protocol: wavelength table read at `open()`, integration
/// time set over a control write, intensities read over the interrupt
/// endpoint after a trigger.
pub struct OceanSpectrometer<T: Transport> {
    transport: T,
    wavelengths: Vec<f64>,
    hw_min_us: u32,
    hw_max_us: u32,
    opened: bool,
}

impl<T: Transport> OceanSpectrometer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            wavelengths: Vec::new(),
            hw_min_us: crate::limits::spectrometer::HW_INTEGRATION_TIME_MIN_US,
            hw_max_us: crate::limits::spectrometer::HW_INTEGRATION_TIME_MAX_US,
            opened: false,
        }
    }
}

impl<T: Transport> Spectrometer for OceanSpectrometer<T> {
    fn open(&mut self) -> Result<()> {
        let mut buf = vec![0u8; PIXEL_COUNT * 8 + 8];
        let n = self
            .transport
            .control_read(CMD_GET_WAVELENGTH_TABLE, 0, 0, &mut buf, CONTROL_TIMEOUT)?;
        if n < 8 {
            return Err(SpectroError::DeviceUnhealthy(
                "wavelength table response too short".into(),
            ));
        }
        self.hw_min_us = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        self.hw_max_us = u32::from_le_bytes(buf[4..8].try_into().unwrap());

        let pixel_bytes = &buf[8..n];
        self.wavelengths = pixel_bytes
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
            .collect();
        if self.wavelengths.is_empty() {
            return Err(SpectroError::DeviceUnhealthy(
                "device reported no pixels".into(),
            ));
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
    }

    fn wavelengths(&self) -> &[f64] {
        &self.wavelengths
    }

    fn set_integration_time_us(&mut self, us: u32) -> Result<()> {
        let clamped = us.clamp(self.hw_min_us, self.hw_max_us);
        let payload = clamped.to_le_bytes();
        self.transport
            .control_write(CMD_SET_INTEGRATION_TIME, 0, 0, &payload, CONTROL_TIMEOUT)?;
        Ok(())
    }

    fn read_intensities(&mut self) -> Result<Vec<f64>> {
        if !self.opened {
            return Err(SpectroError::DeviceNotFound);
        }
        self.transport
            .control_write(CMD_TRIGGER_AND_READ, 0, 0, &[], CONTROL_TIMEOUT)?;
        let pixel_count = self.wavelengths.len();
        let mut buf = vec![0u8; pixel_count * 2];
        self.transport
            .interrupt_read(INTERRUPT_ENDPOINT, &mut buf, CONTROL_TIMEOUT)?;
        Ok(buf
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes(c.try_into().unwrap()) as f64)
            .collect())
    }

    fn integration_limits_us(&self) -> (u32, u32) {
        (self.hw_min_us, self.hw_max_us)
    }
}

/// USB vendor IDs the Ocean-family driver recognizes, and the shared
/// product ID across that family (no support for spectrometers other
/// than one generic Ocean-family USB device").
const OCEAN_VIDS: [u16; 2] = [0x2457, 0x0bd7];
const OCEAN_PID: u16 = 0x1022;

/// Scans USB devices for a supported Ocean-family spectrometer and returns
/// it already claimed and boxed, ready for `Spectrometer::open`.
///
/// A fresh `rusb::Context`, a linear scan for a matching vendor/product pair,
/// `open()` + claim the device's sole interface, then wrap it in a
/// `Transport` impl.
pub fn discover() -> Result<BoxedSpectrometer> {
    let context = Context::new().map_err(SpectroError::Usb)?;
    discover_with_context(&context)
}

/// Discovers using a caller-supplied USB context (testable without opening
/// a fresh one, and reusable if the GUI process already holds a context).
pub fn discover_with_context<T: UsbContext + 'static>(context: &T) -> Result<BoxedSpectrometer> {
    let devices = context.devices().map_err(SpectroError::Usb)?;

    for device in devices.iter() {
        let Ok(desc) = device.device_descriptor() else {
            continue;
        };
        if OCEAN_VIDS.contains(&desc.vendor_id()) && desc.product_id() == OCEAN_PID {
            let handle = device.open().map_err(SpectroError::Usb)?;
            handle.claim_interface(0).map_err(SpectroError::Usb)?;
            let transport = UsbTransport::new(handle);
            return Ok(Box::new(OceanSpectrometer::new(transport)));
        }
    }

    Err(SpectroError::DeviceNotFound)
}

/// A `Spectrometer` that reports no wavelengths and fails every read. Used
/// as the engine's device when `discover()` finds nothing at startup, so
/// the acquisition worker still has something to own and the "Spectrometer
/// not found" banner path is driven by ordinary capture failures
/// instead of a special-cased "no device" state.
#[derive(Default)]
pub struct NullSpectrometer;

impl Spectrometer for NullSpectrometer {
    fn open(&mut self) -> Result<()> {
        Err(SpectroError::DeviceNotFound)
    }

    fn close(&mut self) {}

    fn wavelengths(&self) -> &[f64] {
        &[]
    }

    fn set_integration_time_us(&mut self, _us: u32) -> Result<()> {
        Err(SpectroError::DeviceNotFound)
    }

    fn read_intensities(&mut self) -> Result<Vec<f64>> {
        Err(SpectroError::DeviceNotFound)
    }

    fn integration_limits_us(&self) -> (u32, u32) {
        (
            crate::limits::spectrometer::HW_INTEGRATION_TIME_MIN_US,
            crate::limits::spectrometer::HW_INTEGRATION_TIME_MAX_US,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn wavelength_table_response(min_us: u32, max_us: u32, wavelengths: &[f64]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&min_us.to_le_bytes());
        buf.extend_from_slice(&max_us.to_le_bytes());
        for &w in wavelengths {
            buf.extend_from_slice(&w.to_le_bytes());
        }
        buf
    }

    #[test]
    fn open_parses_limits_and_wavelength_table() {
        let transport = MockTransport::new();
        transport.queue_control_read(wavelength_table_response(3_800, 6_000_000, &[400.0, 410.0, 420.0]));
        let mut dev = OceanSpectrometer::new(transport);
        dev.open().unwrap();
        assert_eq!(dev.wavelengths(), &[400.0, 410.0, 420.0]);
        assert_eq!(dev.integration_limits_us(), (3_800, 6_000_000));
    }

    #[test]
    fn read_intensities_requires_open_device() {
        let transport = MockTransport::new();
        let mut dev = OceanSpectrometer::new(transport);
        let err = dev.read_intensities().unwrap_err();
        assert!(matches!(err, SpectroError::DeviceNotFound));
    }

    #[test]
    fn read_intensities_decodes_le_u16_pixels() {
        let transport = MockTransport::new();
        transport.queue_control_read(wavelength_table_response(3_800, 6_000_000, &[400.0, 410.0]));
        transport.queue_interrupt_read(vec![0x10, 0x00, 0x20, 0x00]);
        let mut dev = OceanSpectrometer::new(transport);
        dev.open().unwrap();
        let data = dev.read_intensities().unwrap();
        assert_eq!(data, vec![16.0, 32.0]);
    }
}
