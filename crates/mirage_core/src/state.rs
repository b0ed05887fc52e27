use std::sync::Arc;

use anyhow::Result;
use mirage_net::{FingerprintProfile, ProtocolRouter, UpstreamProxy};
use mod_auth::ProxyAuth;

use crate::config::Config;
use crate::worker::ScraperService;

/// Everything a connection handler needs, shared behind one `Arc`.
pub struct AppState {
    pub config: Config,
    pub profile: &'static FingerprintProfile,
    pub upstream: Option<UpstreamProxy>,
    /// Forwarding router for the default profile; the same one the
    /// scraper uses, so both share one HTTP/2 pool.
    pub router: Arc<ProtocolRouter>,
    pub auth: Option<ProxyAuth>,
    pub scraper: ScraperService,
}

impl AppState {
    pub fn from_config(config: Config) -> Result<Arc<Self>> {
        config.validate()?;

        let auth = match (&config.proxy_token, config.generate_token) {
            (Some(token), _) => Some(ProxyAuth::new(token.clone())),
            (None, true) => Some(ProxyAuth::generate()),
            (None, false) => None,
        };
        let scraper = ScraperService::new(&config)?;
        let profile = config.profile();
        let router = scraper.client_for(profile).router().clone();

        Ok(Arc::new(Self {
            upstream: config.upstream()?,
            profile,
            router,
            auth,
            scraper,
            config,
        }))
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth.is_some()
    }
}
