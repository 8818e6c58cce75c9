mod app;
mod renderer;
mod screen;
mod shared;
mod theme;

use eframe::egui;

fn main() -> eframe::Result<()> {
    env_logger::init();

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([960.0, 720.0])
            .with_min_inner_size([640.0, 480.0]),
        ..Default::default()
    };

    eframe::run_native(
        "Abyss Spectrometer",
        options,
        Box::new(|cc| Ok(Box::new(app::SpectroApp::new(cc)))),
    )
}
