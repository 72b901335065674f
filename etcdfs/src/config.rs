//! Store connection settings.
//!
//! The endpoint comes from the command line; everything else is optional and
//! read from the environment so the CLI stays at two positionals.

use std::time::Duration;

use anyhow::{Context, Result, bail};

pub const ENV_PREFIX: &str = "ETCDFS_PREFIX";
pub const ENV_USERNAME: &str = "ETCDFS_USERNAME";
pub const ENV_PASSWORD: &str = "ETCDFS_PASSWORD";
pub const ENV_CONNECT_TIMEOUT: &str = "ETCDFS_CONNECT_TIMEOUT_SECS";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    /// Key namespace the filesystem lives under; empty means the whole key space.
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl EtcdConfig {
    /// Builds a config from an endpoint argument such as `http://127.0.0.1:2379`.
    /// Several endpoints may be given separated by commas.
    pub fn from_endpoint(endpoint: &str) -> Result<Self> {
        let endpoints: Vec<String> = endpoint
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if endpoints.is_empty() {
            bail!("no etcd endpoint given");
        }
        Ok(Self {
            endpoints,
            prefix: String::new(),
            username: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Applies overrides from the process environment.
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(prefix) = var(ENV_PREFIX) {
            self.prefix = prefix.trim_end_matches('/').to_string();
        }
        match (var(ENV_USERNAME), var(ENV_PASSWORD)) {
            (Some(user), Some(password)) => {
                self.username = Some(user);
                self.password = Some(password);
            }
            (None, None) => {}
            _ => bail!("{ENV_USERNAME} and {ENV_PASSWORD} must be set together"),
        }
        if let Some(secs) = var(ENV_CONNECT_TIMEOUT) {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid {ENV_CONNECT_TIMEOUT}: {secs}"))?;
            self.connect_timeout = Duration::from_secs(secs);
        }
        Ok(self)
    }
}
