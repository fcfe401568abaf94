use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use axum::http::HeaderValue;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://roomchat.db?mode=rwc";
pub const DEFAULT_CLIENT_URL: &str = "http://localhost:3000";
pub const DEFAULT_PORT: u16 = 5000;

/// Runtime settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// The one origin allowed through CORS.
    pub client_url: HeaderValue,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Config> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_owned());

        let client_url = lookup("CLIENT_URL").unwrap_or_else(|| DEFAULT_CLIENT_URL.to_owned());
        let client_url = HeaderValue::from_str(&client_url)
            .with_context(|| format!("CLIENT_URL {client_url:?} is not a valid origin"))?;

        let port = match lookup("PORT") {
            Some(port) => port
                .parse()
                .with_context(|| format!("PORT {port:?} is not a valid port"))?,
            None => DEFAULT_PORT,
        };

        Ok(Config {
            database_url,
            client_url,
            port,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }
}
