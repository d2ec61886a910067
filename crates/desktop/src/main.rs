//! DevProxy Desktop: admin panel entry.

use eframe::egui;

mod app;

fn main() -> eframe::Result<()> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([900.0, 680.0])
            .with_min_inner_size([640.0, 480.0]),
        ..Default::default()
    };
    eframe::run_native(
        "DevProxy",
        options,
        Box::new(|cc| Box::new(app::DevProxyApp::new(cc))),
    )
}
