use std::path::PathBuf;

use crate::engine::DEFAULT_LOGIN_URL;

/// Server settings, read from `FTV_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends after which the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub login_url: String,
    pub mail_from: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparsable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());

        Self {
            port: number("FTV_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(5480),
            bind: text("FTV_BIND", "0.0.0.0"),
            data_dir: PathBuf::from(text("FTV_DATA_DIR", "./data")),
            password: text("FTV_PASSWORD", "ftv"),
            max_connections: number("FTV_MAX_CONNECTIONS")
                .map(|n| n as usize)
                .filter(|n| *n > 0)
                .unwrap_or(256),
            compact_threshold: number("FTV_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: number("FTV_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            login_url: text("FTV_LOGIN_URL", DEFAULT_LOGIN_URL),
            mail_from: text("FTV_MAIL_FROM", "ftv@localhost"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ftv.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}
