use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::{error, info};

mod artifact;
mod config;
mod error;
mod handlers;
mod state;
mod util;
mod ytdlp;

use crate::state::AppState;
use crate::ytdlp::YtDlpExtractor;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let explicit_cfg = std::env::args().skip_while(|a| a != "--config").nth(1);
    let required = explicit_cfg.is_some();
    let cfg_path = explicit_cfg.unwrap_or_else(|| config::DEFAULT_CONFIG_PATH.to_string());

    let cfg = match config::AppConfig::load(&cfg_path, required) {
        Ok(c) => c,
        Err(e) => {
            error!("[CONFIG] Failed to load {}: {:#}", cfg_path, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = cfg.ensure_output_dir() {
        error!("[STORAGE] Output directory unavailable: {:#}", e);
        std::process::exit(1);
    }

    info!("[CONFIG] Listening on http://{}", cfg.listen_addr);
    info!("[CONFIG] Output directory: {}", cfg.output_dir.display());
    match &cfg.cookies_file {
        Some(p) => info!("[CONFIG] Using cookies file {}", p.display()),
        None => info!("[CONFIG] No cookies file configured"),
    }

    let config = Arc::new(cfg);
    let extractor = Arc::new(YtDlpExtractor::new(config.clone()));
    let state = web::Data::new(AppState::new(config.clone(), extractor));

    let bind_addr = config.listen_addr.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(actix_web::middleware::Logger::default())
            .app_data(state.clone())
            .configure(handlers::configure)
    })
    .bind(bind_addr.as_str())?
    .run()
    .await
}
