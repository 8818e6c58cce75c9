//! Dark/white reference storage, calibration status snapshot, and the
//! auto-integration proportional-control algorithm.

use serde::{Deserialize, Serialize};

use crate::limits::auto_integration as auto;
use crate::limits::spectrometer::HW_MAX_ADC_COUNT;
use crate::settings::SpectrometerSettings;

/// A stored dark or white reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reference {
    pub intensities: Vec<f64>,
    pub integration_time_ms: u32,
}

/// Owned exclusively by the acquisition engine; never touched by any other thread.
#[derive(Debug, Clone, Default)]
pub struct References {
    pub dark: Option<Reference>,
    pub white: Option<Reference>,
    pub auto_integ_integration_ms: Option<u32>,
    pub scans_since_dark: u32,
    pub scans_since_white: u32,
    pub scans_since_auto_integ: u32,
}

impl References {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dark(&mut self, intensities: Vec<f64>, integration_time_ms: u32) {
        self.dark = Some(Reference {
            intensities,
            integration_time_ms,
        });
        self.scans_since_dark = 0;
    }

    pub fn set_white(&mut self, intensities: Vec<f64>, integration_time_ms: u32) {
        self.white = Some(Reference {
            intensities,
            integration_time_ms,
        });
        self.scans_since_white = 0;
    }

    pub fn set_auto_integ_completed(&mut self, integration_time_ms: u32) {
        self.auto_integ_integration_ms = Some(integration_time_ms);
        self.scans_since_auto_integ = 0;
    }

    /// Changing `integration_time_ms` invalidates both references and the
    /// auto-integration "completed" marker.
    pub fn invalidate_on_integration_change(&mut self) {
        self.dark = None;
        self.white = None;
        self.auto_integ_integration_ms = None;
    }

    /// Changing `scans_to_average` invalidates both references only, not
    /// auto-integration.
    pub fn invalidate_on_averaging_change(&mut self) {
        self.dark = None;
        self.white = None;
        self.scans_since_dark = 0;
        self.scans_since_white = 0;
    }

    /// Validity predicate, identical on the engine and UI side.
    pub fn valid_for_reflectance(&self, settings_integration_ms: u32) -> bool {
        let dark_ok = self
            .dark
            .as_ref()
            .is_some_and(|d| d.integration_time_ms == settings_integration_ms);
        let white_ok = self
            .white
            .as_ref()
            .is_some_and(|w| w.integration_time_ms == settings_integration_ms);
        dark_ok && white_ok
    }

    pub fn status(&self) -> CalibrationStatus {
        CalibrationStatus {
            has_dark_ref: self.dark.is_some(),
            dark_integration_ms: self.dark.as_ref().map(|d| d.integration_time_ms),
            has_white_ref: self.white.is_some(),
            white_integration_ms: self.white.as_ref().map(|w| w.integration_time_ms),
            auto_integ_completed: self.auto_integ_integration_ms.is_some(),
            auto_integ_integration_ms: self.auto_integ_integration_ms,
            scans_since_dark: self.scans_since_dark,
            scans_since_white: self.scans_since_white,
            scans_since_auto_integ: self.scans_since_auto_integ,
        }
    }
}

/// Compact snapshot piggybacked on every `ScanResult` so the UI never reaches
/// into engine-owned reference data.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CalibrationStatus {
    pub has_dark_ref: bool,
    pub dark_integration_ms: Option<u32>,
    pub has_white_ref: bool,
    pub white_integration_ms: Option<u32>,
    pub auto_integ_completed: bool,
    pub auto_integ_integration_ms: Option<u32>,
    pub scans_since_dark: u32,
    pub scans_since_white: u32,
    pub scans_since_auto_integ: u32,
}

impl CalibrationStatus {
    pub fn valid_for_reflectance(&self, settings: &SpectrometerSettings) -> bool {
        let dark_ok = self.has_dark_ref && self.dark_integration_ms == Some(settings.integration_time_ms);
        let white_ok = self.has_white_ref && self.white_integration_ms == Some(settings.integration_time_ms);
        dark_ok && white_ok
    }
}

/// Computes reflectance: `(raw - dark) / (white - dark)`, zero where the
/// denominator is within epsilon of zero, clipped to `[0, ceiling]`.
pub fn compute_reflectance(raw: &[f64], dark: &[f64], white: &[f64], epsilon: f64, ceiling: f64) -> Vec<f64> {
    raw.iter()
        .zip(dark.iter())
        .zip(white.iter())
        .map(|((&r, &d), &w)| {
            let denom = w - d;
            if denom.abs() > epsilon {
                ((r - d) / denom).clamp(0.0, ceiling)
            } else {
                0.0
            }
        })
        .collect()
}

/// The outcome of one auto-integration iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoIntegOutcome {
    /// Within the target ADC window.
    Converged { integration_time_us: u32 },
    /// At the minimum integration time and still saturated.
    SaturatedAtMin { integration_time_us: u32 },
    /// At the maximum integration time and still too dim.
    TooDimAtMax { integration_time_us: u32 },
    /// The proposed next step did not move, but the target wasn't reached.
    NoFurtherAdjustment { integration_time_us: u32 },
    /// Ran out of iterations.
    MaxIterationsReached { integration_time_us: u32 },
    /// Keep iterating at the returned integration time.
    Continue {
        integration_time_us: u32,
        direction: i8,
    },
}

/// Mutable state threaded between auto-integration iterations.
#[derive(Debug, Clone, Copy)]
pub struct AutoIntegState {
    pub test_integration_us: u32,
    pub iteration: u32,
    pub previous_direction: i8,
}

impl AutoIntegState {
    pub fn new(initial_integration_us: u32) -> Self {
        Self {
            test_integration_us: initial_integration_us,
            iteration: 0,
            previous_direction: 0,
        }
    }
}

/// One step of the proportional-control-with-damping auto-integration
/// algorithm.
///
/// `hw_min`/`hw_max` are the device-reported integration limits in microseconds.
pub fn auto_integration_step(
    state: &mut AutoIntegState,
    peak_adc: f64,
    hw_min: u32,
    hw_max: u32,
) -> AutoIntegOutcome {
    let target_low = auto::TARGET_LOW_PERCENT / 100.0 * HW_MAX_ADC_COUNT;
    let target_high = auto::TARGET_HIGH_PERCENT / 100.0 * HW_MAX_ADC_COUNT;
    let target_mid = (target_low + target_high) / 2.0;

    state.iteration += 1;
    let t_us = state.test_integration_us;

    if (target_low..=target_high).contains(&peak_adc) {
        return AutoIntegOutcome::Converged {
            integration_time_us: t_us,
        };
    }
    if t_us <= hw_min && peak_adc > target_high {
        return AutoIntegOutcome::SaturatedAtMin {
            integration_time_us: t_us,
        };
    }
    if t_us >= hw_max && peak_adc < target_low {
        return AutoIntegOutcome::TooDimAtMax {
            integration_time_us: t_us,
        };
    }
    if state.iteration >= auto::MAX_ITERATIONS {
        return AutoIntegOutcome::MaxIterationsReached {
            integration_time_us: t_us,
        };
    }

    let effective_peak = peak_adc.max(1.0);
    let ratio = target_mid / effective_peak;
    let ideal_us = t_us as f64 * ratio;
    let mut delta = (ideal_us - t_us as f64) * auto::PROPORTIONAL_GAIN;

    let direction: i8 = if delta > 0.0 {
        1
    } else if delta < 0.0 {
        -1
    } else {
        0
    };
    if state.previous_direction != 0 && direction != 0 && direction == -state.previous_direction {
        delta *= auto::OSCILLATION_DAMPING_FACTOR;
    }

    if delta.abs() < auto::MIN_ADJUSTMENT_US {
        delta = if peak_adc < target_low {
            auto::MIN_ADJUSTMENT_US
        } else {
            -auto::MIN_ADJUSTMENT_US
        };
    }

    let new_t_us = (t_us as f64 + delta).round().clamp(hw_min as f64, hw_max as f64) as u32;

    if new_t_us == t_us {
        return AutoIntegOutcome::NoFurtherAdjustment {
            integration_time_us: t_us,
        };
    }

    state.test_integration_us = new_t_us;
    state.previous_direction = direction;
    AutoIntegOutcome::Continue {
        integration_time_us: new_t_us,
        direction,
    }
}

/// Drives the whole iteration loop against a pure peak-ADC model, used by
/// property tests and by the GUI's blocking synchronous test harness. The
/// GUI itself drives this one step at a time against live `ScanResult`s.
pub fn run_auto_integration<F: FnMut(u32) -> f64>(
    initial_integration_us: u32,
    hw_min: u32,
    hw_max: u32,
    mut peak_for: F,
) -> (AutoIntegOutcome, u32) {
    let mut state = AutoIntegState::new(initial_integration_us.clamp(hw_min, hw_max));
    loop {
        let peak = peak_for(state.test_integration_us);
        let outcome = auto_integration_step(&mut state, peak, hw_min, hw_max);
        if !matches!(outcome, AutoIntegOutcome::Continue { .. }) {
            return (outcome, state.iteration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[test]
    fn reflectance_with_zero_dark_and_unit_white_is_identity() {
        let raw = vec![0.0, 0.5, 1.0, 5.0, 300.0];
        let dark = vec![0.0; 5];
        let white = vec![1.0; 5];
        let refl = compute_reflectance(&raw, &dark, &white, 1e-9, 200.0);
        assert_relative_eq!(refl[0], 0.0);
        assert_relative_eq!(refl[1], 0.5);
        assert_relative_eq!(refl[2], 1.0);
        assert_relative_eq!(refl[3], 5.0);
        // clipped to the ceiling
        assert_relative_eq!(refl[4], 200.0);
    }

    #[test]
    fn reflectance_denominator_near_zero_yields_zero() {
        let raw = vec![10.0];
        let dark = vec![5.0];
        let white = vec![5.0 + 1e-12];
        let refl = compute_reflectance(&raw, &dark, &white, 1e-9, 200.0);
        assert_relative_eq!(refl[0], 0.0);
    }

    #[test]
    fn validity_predicate_requires_matching_integration_time() {
        let mut refs = References::new();
        refs.set_dark(vec![1.0], 500);
        refs.set_white(vec![2.0], 500);
        assert!(refs.valid_for_reflectance(500));
        assert!(!refs.valid_for_reflectance(1000));
    }

    #[test]
    fn integration_change_invalidates_both_refs_and_auto_integ() {
        let mut refs = References::new();
        refs.set_dark(vec![1.0], 500);
        refs.set_white(vec![2.0], 500);
        refs.set_auto_integ_completed(500);
        refs.invalidate_on_integration_change();
        assert!(refs.dark.is_none());
        assert!(refs.white.is_none());
        assert!(refs.auto_integ_integration_ms.is_none());
    }

    #[test]
    fn averaging_change_invalidates_refs_but_not_auto_integ() {
        let mut refs = References::new();
        refs.set_dark(vec![1.0], 500);
        refs.set_white(vec![2.0], 500);
        refs.set_auto_integ_completed(500);
        refs.invalidate_on_averaging_change();
        assert!(refs.dark.is_none());
        assert!(refs.white.is_none());
        assert!(refs.auto_integ_integration_ms.is_some());
    }

    #[test]
    fn auto_integration_converges_within_max_iterations() {
        let hw_min = 3_800u32;
        let hw_max = 6_000_000u32;
        let k = 16383.0 / 50_000.0; // target midpoint reached near t_us ~ 50_000
        let (outcome, iterations) = run_auto_integration(100_000, hw_min, hw_max, |t_us| {
            (t_us as f64 * k).min(16383.0)
        });
        assert!(iterations <= auto::MAX_ITERATIONS);
        match outcome {
            AutoIntegOutcome::Converged {
                integration_time_us,
            } => {
                let t_ms = (integration_time_us as f64 / 1000.0).round() as i64;
                assert!((45..=55).contains(&t_ms), "converged at {t_ms}ms");
            }
            other => panic!("expected convergence, got {other:?}"),
        }
    }

    #[test]
    fn auto_integration_terminates_when_saturated_at_minimum() {
        let hw_min = 3_800u32;
        let hw_max = 6_000_000u32;
        let (outcome, iterations) =
            run_auto_integration(hw_min, hw_min, hw_max, |_t_us| 16383.0);
        assert!(iterations <= auto::MAX_ITERATIONS);
        assert!(matches!(
            outcome,
            AutoIntegOutcome::SaturatedAtMin { .. } | AutoIntegOutcome::Converged { .. }
        ));
    }

    #[test]
    fn auto_integration_terminates_when_too_dim_at_maximum() {
        let hw_min = 3_800u32;
        let hw_max = 20_000u32;
        let (outcome, iterations) = run_auto_integration(hw_max, hw_min, hw_max, |_t_us| 10.0);
        assert!(iterations <= auto::MAX_ITERATIONS);
        assert!(matches!(outcome, AutoIntegOutcome::TooDimAtMax { .. }));
    }

    #[rstest]
    #[case::far_below(5_000)]
    #[case::near_target(48_000)]
    #[case::far_above(4_000_000)]
    fn auto_integration_converges_from_any_starting_point(#[case] initial_us: u32) {
        let hw_min = 3_800u32;
        let hw_max = 6_000_000u32;
        let k = 16383.0 / 50_000.0;
        let (outcome, iterations) = run_auto_integration(initial_us, hw_min, hw_max, |t_us| {
            (t_us as f64 * k).min(16383.0)
        });
        assert!(iterations <= auto::MAX_ITERATIONS);
        assert!(matches!(outcome, AutoIntegOutcome::Converged { .. }));
    }

    #[test]
    fn auto_integration_reports_max_iterations_on_the_20th_call_when_never_converging() {
        let hw_min = 3_800u32;
        let hw_max = 6_000_000u32;
        // A peak held constant just above the target window and independent
        // of the requested integration time: the proportional step keeps
        // nudging `t_us` down but never reaches the window or either
        // hardware rail within 20 calls, so the 20th call itself must report
        // max-iterations rather than a 21st round trip.
        let (outcome, iterations) = run_auto_integration(100_000, hw_min, hw_max, |_t_us| 16_000.0);
        assert_eq!(iterations, auto::MAX_ITERATIONS);
        assert!(matches!(
            outcome,
            AutoIntegOutcome::MaxIterationsReached { .. }
        ));
    }

    #[rstest]
    #[case::below_range(-10.0, 0.0)]
    #[case::at_zero(0.0, 0.0)]
    #[case::mid_range(100.0, 100.0)]
    #[case::at_ceiling(200.0, 200.0)]
    #[case::above_ceiling(250.0, 200.0)]
    fn reflectance_clamps_at_boundary_values(#[case] raw_value: f64, #[case] expected: f64) {
        let refl = compute_reflectance(&[raw_value], &[0.0], &[1.0], 1e-9, 200.0);
        assert_relative_eq!(refl[0], expected);
    }
}
