pub mod wc;

use crate::mr::App;

pub fn get_app(app: &str) -> Result<App, anyhow::Error> {
    match app {
        "wc" => Ok(App::new(app, wc::WC)),
        "rwc" => Ok(App::new(app, wc::RegexWC::new()?)),
        _ => Err(anyhow::anyhow!("Unknown app: {}", app)),
    }
}
