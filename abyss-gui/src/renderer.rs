//! `SpectralRenderer`: the plot widget interface and the `egui_plot`
//! implementation used by the desktop-window path.
//!
//! A raw-framebuffer backend for a direct-LCD deployment can implement the
//! same trait without touching the acquisition or UI-state code.

use crate::theme;
use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints};

/// A target point count the live view decimates to before drawing, so a
/// 2048-pixel spectrum doesn't repaint 2048 vertices every frame.
const DECIMATION_TARGET_POINTS: usize = 512;

pub trait SpectralRenderer {
    fn set_wavelengths(&mut self, wavelengths: &[f64]);
    fn set_y_limits(&mut self, min: f64, max: f64);
    fn update_spectrum(&mut self, intensities: &[f64], smoothing: bool);
    fn draw(&mut self, ui: &mut egui::Ui);
}

pub struct EguiSpectralRenderer {
    wavelengths: Vec<f64>,
    intensities: Vec<f64>,
    y_min: f64,
    y_max: f64,
}

impl Default for EguiSpectralRenderer {
    fn default() -> Self {
        Self {
            wavelengths: Vec::new(),
            intensities: Vec::new(),
            y_min: 0.0,
            y_max: 1.2,
        }
    }
}

impl EguiSpectralRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    fn decimated_points(&self, values: &[f64]) -> PlotPoints {
        let n = self.wavelengths.len().min(values.len());
        if n == 0 {
            return PlotPoints::default();
        }
        let stride = (n / DECIMATION_TARGET_POINTS).max(1);
        (0..n)
            .step_by(stride)
            .map(|i| [self.wavelengths[i], values[i]])
            .collect::<Vec<_>>()
            .into()
    }

    fn smoothed(values: &[f64]) -> Vec<f64> {
        const WINDOW: usize = abyss_spectro_core::limits::plotting::LIVE_SMOOTHING_WINDOW_SIZE;
        if values.len() < WINDOW {
            return values.to_vec();
        }
        let half = WINDOW / 2;
        (0..values.len())
            .map(|i| {
                let lo = i.saturating_sub(half);
                let hi = (i + half + 1).min(values.len());
                let slice = &values[lo..hi];
                slice.iter().sum::<f64>() / slice.len() as f64
            })
            .collect()
    }
}

impl SpectralRenderer for EguiSpectralRenderer {
    fn set_wavelengths(&mut self, wavelengths: &[f64]) {
        self.wavelengths = wavelengths.to_vec();
    }

    fn set_y_limits(&mut self, min: f64, max: f64) {
        self.y_min = min;
        self.y_max = max;
    }

    fn update_spectrum(&mut self, intensities: &[f64], smoothing: bool) {
        self.intensities = if smoothing {
            Self::smoothed(intensities)
        } else {
            intensities.to_vec()
        };
    }

    fn draw(&mut self, ui: &mut egui::Ui) {
        let visuals = ui.visuals().clone();
        let line_color = theme::plot_line_color(&visuals);
        let points = self.decimated_points(&self.intensities);

        Plot::new("spectral_plot")
            .include_y(self.y_min)
            .include_y(self.y_max)
            .y_axis_label("Intensity")
            .x_axis_label("Wavelength (nm)")
            .show(ui, |plot_ui| {
                plot_ui.line(Line::new(points).color(line_color).width(1.5));
            });
    }
}
