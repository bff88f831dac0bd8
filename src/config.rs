use anyhow::{Context, Result};
use log::info;
use std::env;
use std::time::Duration;

use crate::chat::session::DEFAULT_KEEP_LAST_N;

#[derive(Debug, Clone)]
pub struct Settings {
    pub fintool_host: String,
    pub fintool_api_key: String,
    pub bind_addr: String,
    pub port: u16,
    pub chat_endpoint: String,
    pub keep_last_n: usize,
    pub templates_glob: String,
    /// Idle conversations are dropped from memory after this long.
    pub session_idle: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let fintool_host = env::var("FINTOOL_HOST").context("FINTOOL_HOST must be set")?;
        let fintool_api_key = env::var("FINTOOL_API_KEY").context("FINTOOL_API_KEY must be set")?;

        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8080);
        let chat_endpoint = env::var("CHAT_ENDPOINT").unwrap_or_else(|_| "v1/chat".to_string());
        let keep_last_n = env::var("KEEP_LAST_N")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(DEFAULT_KEEP_LAST_N);
        let templates_glob = env::var("TEMPLATES_GLOB").unwrap_or_else(|_| "templates/**/*".to_string());
        let session_idle_secs = env::var("SESSION_IDLE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(3600);

        info!("Using backend at: {}", fintool_host);

        Ok(Self {
            fintool_host: fintool_host.trim_end_matches('/').to_string(),
            fintool_api_key,
            bind_addr,
            port,
            chat_endpoint,
            keep_last_n,
            templates_glob,
            session_idle: Duration::from_secs(session_idle_secs),
        })
    }
}
