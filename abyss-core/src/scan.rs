//! Acquisition results and data-writer save requests.

use crate::calibration::CalibrationStatus;
use crate::settings::{CollectionMode, LensType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tagged spectrum classification, also used verbatim as the CSV `spectra_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectraType {
    Raw,
    Reflectance,
    Dark,
    White,
    RawReflectance,
    AutoInteg,
}

impl SpectraType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpectraType::Raw => "RAW",
            SpectraType::Reflectance => "REFLECTANCE",
            SpectraType::Dark => "DARK",
            SpectraType::White => "WHITE",
            SpectraType::RawReflectance => "RAW_REFLECTANCE",
            SpectraType::AutoInteg => "AUTO_INTEG",
        }
    }

    /// RAW and REFLECTANCE sample captures get a companion PNG; references and
    /// the raw-target companion row do not.
    pub fn wants_png_plot(&self) -> bool {
        matches!(self, SpectraType::Raw | SpectraType::Reflectance)
    }
}

/// A single acquisition result, produced by the engine and consumed by the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub wavelengths: Vec<f64>,
    pub intensities: Vec<f64>,
    /// Present iff `spectra_type == Reflectance`: the pre-reflectance raw target.
    pub raw_intensities: Option<Vec<f64>>,
    pub timestamp: DateTime<Utc>,
    pub integration_time_ms: u32,
    pub spectra_type: SpectraType,
    pub session_id: u64,
    pub is_valid: bool,
    /// Populated for `AutoInteg` only: max over raw intensities.
    pub peak_adc_value: Option<f64>,
    /// Populated for `AutoInteg` only: echoes the requested test integration.
    pub test_integration_us: Option<u32>,
    pub calibration_status: CalibrationStatus,
}

impl ScanResult {
    /// wavelengths/intensities/raw_intensities must agree in length.
    pub fn lengths_consistent(&self) -> bool {
        let n = self.wavelengths.len();
        if self.intensities.len() != n {
            return false;
        }
        match &self.raw_intensities {
            Some(raw) => raw.len() == n,
            None => true,
        }
    }
}

/// UI → Data Writer request: everything needed to append a CSV row and,
/// for sample captures, render a companion PNG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveRequest {
    pub wavelengths: Vec<f64>,
    pub intensities: Vec<f64>,
    pub raw_intensities: Option<Vec<f64>>,
    pub timestamp: DateTime<Utc>,
    pub integration_time_ms: u32,
    pub spectra_type: SpectraType,
    pub collection_mode: CollectionMode,
    pub lens_type: LensType,
    pub temperature_c: Option<f64>,
}

impl SaveRequest {
    pub fn from_scan(scan: &ScanResult, collection_mode: CollectionMode, lens_type: LensType, temperature_c: Option<f64>) -> Self {
        Self {
            wavelengths: scan.wavelengths.clone(),
            intensities: scan.intensities.clone(),
            raw_intensities: scan.raw_intensities.clone(),
            timestamp: scan.timestamp,
            integration_time_ms: scan.integration_time_ms,
            spectra_type: scan.spectra_type,
            collection_mode,
            lens_type,
            temperature_c,
        }
    }

    /// Builds the companion `RAW_REFLECTANCE` row saved alongside a REFLECTANCE
    /// row: same timestamp and integration time, raw
    /// values in the `intensities` slot.
    pub fn raw_reflectance_companion(&self) -> Option<SaveRequest> {
        if self.spectra_type != SpectraType::Reflectance {
            return None;
        }
        let raw = self.raw_intensities.clone()?;
        Some(SaveRequest {
            wavelengths: self.wavelengths.clone(),
            intensities: raw,
            raw_intensities: None,
            timestamp: self.timestamp,
            integration_time_ms: self.integration_time_ms,
            spectra_type: SpectraType::RawReflectance,
            collection_mode: self.collection_mode,
            lens_type: self.lens_type,
            temperature_c: self.temperature_c,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationStatus;

    fn sample_scan(spectra_type: SpectraType, raw: Option<Vec<f64>>) -> ScanResult {
        ScanResult {
            wavelengths: vec![400.0, 410.0, 420.0],
            intensities: vec![1.0, 2.0, 3.0],
            raw_intensities: raw,
            timestamp: Utc::now(),
            integration_time_ms: 500,
            spectra_type,
            session_id: 1,
            is_valid: true,
            peak_adc_value: None,
            test_integration_us: None,
            calibration_status: CalibrationStatus::default(),
        }
    }

    #[test]
    fn lengths_consistent_checks_raw_too() {
        let ok = sample_scan(SpectraType::Reflectance, Some(vec![1.0, 2.0, 3.0]));
        assert!(ok.lengths_consistent());
        let bad = sample_scan(SpectraType::Reflectance, Some(vec![1.0, 2.0]));
        assert!(!bad.lengths_consistent());
    }

    #[test]
    fn reflectance_save_produces_matching_companion() {
        let scan = sample_scan(SpectraType::Reflectance, Some(vec![10.0, 20.0, 30.0]));
        let save = SaveRequest::from_scan(&scan, CollectionMode::Reflectance, LensType::Fiber, None);
        let companion = save.raw_reflectance_companion().expect("companion row");
        assert_eq!(companion.spectra_type, SpectraType::RawReflectance);
        assert_eq!(companion.timestamp, save.timestamp);
        assert_eq!(companion.integration_time_ms, save.integration_time_ms);
        assert_eq!(companion.intensities, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn raw_save_has_no_companion() {
        let scan = sample_scan(SpectraType::Raw, None);
        let save = SaveRequest::from_scan(&scan, CollectionMode::Raw, LensType::Fiber, None);
        assert!(save.raw_reflectance_companion().is_none());
    }
}
