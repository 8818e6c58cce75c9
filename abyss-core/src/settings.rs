//! Shared instrument settings and the time-offset editor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::limits::spectrometer as limits;

/// Tagged collection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionMode {
    Raw,
    Reflectance,
}

/// Tagged lens configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LensType {
    Fiber,
    Cable,
    FiberCable,
}

impl LensType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LensType::Fiber => "FIBER",
            LensType::Cable => "CABLE",
            LensType::FiberCable => "FIBER+CABLE",
        }
    }
}

/// Shared settings, single writer (UI), single reader per capture (engine).
///
/// The engine snapshots this by value at the start of every capture cycle;
/// there is no lock held across the capture itself.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpectrometerSettings {
    pub integration_time_ms: u32,
    pub scans_to_average: u32,
    pub collection_mode: CollectionMode,
    pub lens_type: LensType,
}

impl Default for SpectrometerSettings {
    fn default() -> Self {
        Self {
            integration_time_ms: limits::DEFAULT_INTEGRATION_TIME_MS,
            scans_to_average: limits::DEFAULT_SCANS_TO_AVERAGE,
            collection_mode: CollectionMode::Raw,
            lens_type: LensType::Fiber,
        }
    }
}

impl SpectrometerSettings {
    /// Clamp `integration_time_ms` to the menu range and align it to the step size.
    pub fn clamp_integration_time_ms(value: u32) -> u32 {
        let clamped = value.clamp(
            limits::MIN_INTEGRATION_TIME_MS,
            limits::MAX_INTEGRATION_TIME_MS,
        );
        let step = limits::INTEGRATION_TIME_STEP_MS;
        (clamped / step) * step
    }

    /// Clamp `scans_to_average` to the menu range. 0 and 1 both mean "single scan".
    pub fn clamp_scans_to_average(value: u32) -> u32 {
        value.clamp(
            limits::MIN_SCANS_TO_AVERAGE,
            limits::MAX_SCANS_TO_AVERAGE,
        )
    }

    /// Number of device reads a capture cycle should average together.
    pub fn effective_scan_count(&self) -> u32 {
        self.scans_to_average.max(1)
    }

    pub fn set_integration_time_ms(&mut self, value: u32) -> bool {
        let clamped = Self::clamp_integration_time_ms(value);
        let changed = clamped != self.integration_time_ms;
        self.integration_time_ms = clamped;
        changed
    }

    pub fn set_scans_to_average(&mut self, value: u32) -> bool {
        let clamped = Self::clamp_scans_to_average(value);
        let changed = clamped != self.scans_to_average;
        self.scans_to_average = clamped;
        changed
    }
}

/// Menu-driven wall-clock adjustment.
///
/// `offset` is applied as `displayed_time = system_time + offset`. Edits are
/// staged in `pending` until `commit()`; `discard()` drops them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeOffset {
    offset: Duration,
    negative: bool,
    pending: Option<(Duration, bool)>,
}

impl TimeOffset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies the committed offset to a system time.
    pub fn apply_to(&self, time: SystemTime) -> SystemTime {
        if self.negative {
            time.checked_sub(self.offset).unwrap_or(time)
        } else {
            time.checked_add(self.offset).unwrap_or(time)
        }
    }

    /// Stage an edit (not yet visible to `apply_to`).
    pub fn begin_edit(&mut self, offset: Duration, negative: bool) {
        self.pending = Some((offset, negative));
    }

    /// Commit the staged edit, making it the active offset.
    pub fn commit(&mut self) {
        if let Some((offset, negative)) = self.pending.take() {
            self.offset = offset;
            self.negative = negative;
        }
    }

    /// Discard the staged edit, leaving the active offset untouched.
    pub fn discard(&mut self) {
        self.pending = None;
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }
}

/// A `TimeOffset` shared between the UI (sole writer) and the acquisition
/// engine (sole reader, for stamping `ScanResult::timestamp`).
#[derive(Clone, Default)]
pub struct SharedTimeOffset(Arc<Mutex<TimeOffset>>);

impl SharedTimeOffset {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TimeOffset::new())))
    }

    /// The current adjusted wall-clock time.
    pub fn now(&self) -> DateTime<Utc> {
        let offset = self.0.lock().expect("time offset mutex poisoned");
        DateTime::<Utc>::from(offset.apply_to(SystemTime::now()))
    }

    pub fn begin_edit(&self, offset: Duration, negative: bool) {
        self.0
            .lock()
            .expect("time offset mutex poisoned")
            .begin_edit(offset, negative);
    }

    pub fn commit(&self) {
        self.0.lock().expect("time offset mutex poisoned").commit();
    }

    pub fn discard(&self) {
        self.0.lock().expect("time offset mutex poisoned").discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn integration_time_clamps_and_aligns_to_step() {
        assert_eq!(SpectrometerSettings::clamp_integration_time_ms(50), 100);
        assert_eq!(SpectrometerSettings::clamp_integration_time_ms(10_000), 6000);
        assert_eq!(SpectrometerSettings::clamp_integration_time_ms(523), 500);
    }

    #[test]
    fn clamping_is_idempotent() {
        for raw in [0, 50, 123, 523, 6000, 9999] {
            let once = SpectrometerSettings::clamp_integration_time_ms(raw);
            let twice = SpectrometerSettings::clamp_integration_time_ms(once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn scans_to_average_zero_and_one_both_mean_single_scan() {
        let mut s = SpectrometerSettings::default();
        s.scans_to_average = 0;
        assert_eq!(s.effective_scan_count(), 1);
        s.scans_to_average = 1;
        assert_eq!(s.effective_scan_count(), 1);
    }

    #[test]
    fn time_offset_round_trip_within_a_second() {
        let mut t = TimeOffset::new();
        let delta = Duration::from_secs(3600);
        t.begin_edit(delta, false);
        t.commit();
        let now = SystemTime::now();
        let displayed = t.apply_to(now);
        let measured = displayed
            .duration_since(now)
            .expect("displayed time should be after now");
        assert_relative_eq!(measured.as_secs_f64(), delta.as_secs_f64(), epsilon = 1.0);
    }

    #[test]
    fn discarded_edit_does_not_change_offset() {
        let mut t = TimeOffset::new();
        t.begin_edit(Duration::from_secs(60), false);
        t.discard();
        assert_eq!(t.offset(), Duration::ZERO);
    }
}
