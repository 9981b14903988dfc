use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, anyhow, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_max_cache_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_notfound_cache_ttl() -> u64 {
    5
}

fn default_upstream_timeout() -> u64 {
    300
}

fn default_upstream_connect_timeout() -> u64 {
    5
}

fn default_client_timeout() -> u64 {
    30
}

fn default_max_idle_conns() -> usize {
    100
}

fn default_max_idle_conns_per_host() -> usize {
    10
}

fn default_index_save_interval() -> u64 {
    300
}

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub listen_addr: SocketAddr,
    pub upstream_url: String,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,
    #[serde(default = "default_cache_ttl")]
    pub default_cache_ttl: u64,
    #[serde(default = "default_notfound_cache_ttl")]
    pub notfound_cache_ttl: u64,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_client_timeout")]
    pub client_timeout: u64,
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,
    #[serde(default = "default_max_idle_conns_per_host")]
    pub max_idle_conns_per_host: usize,
    #[serde(default = "default_index_save_interval")]
    pub index_save_interval: u64,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;

        let cfg = Config::builder()
            .add_source(File::from(config_path.clone()).required(true))
            .add_source(
                Environment::with_prefix("EDGESTASH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        settings.validate()?;
        Ok(settings)
    }

    pub fn default_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.default_cache_ttl)
    }

    pub fn notfound_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.notfound_cache_ttl)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn index_save_interval(&self) -> Duration {
        Duration::from_secs(self.index_save_interval)
    }

    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.cache_dir = absolutize(&self.cache_dir, base_dir);
        if let Some(cert) = self.tls_cert_file.clone() {
            self.tls_cert_file = Some(absolutize(&cert, base_dir));
        }
        if let Some(key) = self.tls_key_file.clone() {
            self.tls_key_file = Some(absolutize(&key, base_dir));
        }
    }

    pub fn validate(&self) -> Result<()> {
        UpstreamTarget::parse(&self.upstream_url)?;
        ensure!(
            self.max_cache_size > 0,
            "max_cache_size must be greater than 0 (got {})",
            self.max_cache_size
        );
        ensure!(
            self.default_cache_ttl > 0,
            "default_cache_ttl must be greater than 0 seconds (got {})",
            self.default_cache_ttl
        );
        ensure!(
            self.notfound_cache_ttl > 0,
            "notfound_cache_ttl must be greater than 0 seconds (got {})",
            self.notfound_cache_ttl
        );
        ensure!(
            self.upstream_timeout > 0,
            "upstream_timeout must be greater than 0 seconds (got {})",
            self.upstream_timeout
        );
        ensure!(
            self.upstream_connect_timeout > 0,
            "upstream_connect_timeout must be greater than 0 seconds (got {})",
            self.upstream_connect_timeout
        );
        ensure!(
            self.client_timeout > 0,
            "client_timeout must be greater than 0 seconds (got {})",
            self.client_timeout
        );
        ensure!(
            self.max_idle_conns > 0,
            "max_idle_conns must be at least 1 (got {})",
            self.max_idle_conns
        );
        ensure!(
            self.max_idle_conns_per_host > 0,
            "max_idle_conns_per_host must be at least 1 (got {})",
            self.max_idle_conns_per_host
        );
        ensure!(
            self.index_save_interval > 0,
            "index_save_interval must be greater than 0 seconds (got {})",
            self.index_save_interval
        );
        let tls_cert_set = self.tls_cert_file.is_some();
        let tls_key_set = self.tls_key_file.is_some();
        ensure!(
            tls_cert_set == tls_key_set,
            "tls_cert_file and tls_key_file must both be set or both be absent"
        );
        Ok(())
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config.as_deref() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/edgestash/edgestash.toml"),
        PathBuf::from("edgestash.toml"),
    ]
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// The single configured origin, parsed out of `upstream_url`.
///
/// The base path is kept without its trailing slash so request keys
/// (which always carry a leading `/`) can be appended directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub base_path: String,
}

impl UpstreamTarget {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("http://") {
            (Scheme::Http, rest)
        } else if let Some(rest) = url.strip_prefix("https://") {
            (Scheme::Https, rest)
        } else {
            bail!("upstream_url '{url}' must start with http:// or https://");
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };
        ensure!(
            !authority.is_empty(),
            "upstream_url '{url}' is missing a host"
        );

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                ensure!(!host.is_empty(), "upstream_url '{url}' is missing a host");
                let port: u16 = port
                    .parse()
                    .map_err(|_| anyhow!("invalid upstream port '{port}' in '{url}'"))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), scheme.default_port()),
        };

        let base_path = path.trim_end_matches('/').to_string();

        Ok(Self {
            scheme,
            host,
            port,
            base_path,
        })
    }

    /// The origin-form request target for a cache key.
    pub fn request_target(&self, key: &str) -> String {
        format!("{}{}", self.base_path, key)
    }

    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
