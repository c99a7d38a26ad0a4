use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::config::AppConfig;
use crate::ytdlp::Extractor;

pub struct AppState {
    pub limiter: Arc<Semaphore>,
    pub extractor: Arc<dyn Extractor>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            limiter: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            extractor,
            config,
        }
    }
}
