pub mod api;
pub mod config;
pub mod engine;
pub mod frontend;
pub mod logging;
pub mod state;
pub mod worker;

pub use config::{Cli, Config, LogFormat};
pub use engine::ProxyEngine;
pub use state::AppState;
pub use worker::ScraperService;
