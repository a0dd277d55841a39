use serde::Deserialize;
use std::{collections::HashSet, fs, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// The configuration file as written. Every field is optional;
/// `finalize` fills in defaults and validates.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub proxy: Option<ProxyConfig>,
    pub region: Option<RegionConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    pub bind_addr: Option<String>,
    /// Admin listener for `/metrics`, `/status`, `/health` and `/assignments`.
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyConfig {
    pub upstreams: Option<Vec<String>>,
    pub ttl_secs: Option<u64>,
    pub scheme: Option<String>,
    pub cache_path: Option<String>,
    pub cache_map_size_mb: Option<usize>,
    pub serialize_per_key: Option<bool>,
    // Forwarding client settings
    pub connect_timeout_ms: Option<u64>,
    pub timeout_secs: Option<u64>,
    /// Largest accepted request body. Unset or `0` means no limit.
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RegionConfig {
    pub url: String,
    pub timeout_ms: Option<u64>,
}

/// Values that override the file, typically from the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub upstreams: Option<Vec<String>>,
    pub ttl_secs: Option<u64>,
    pub cache_path: Option<String>,
    pub bind_addr: Option<String>,
    pub metrics_addr: Option<String>,
    pub region_url: Option<String>,
}

/// Fully resolved settings. Produced only by `Config::finalize`.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub metrics_addr: Option<String>,
    pub upstreams: Vec<String>,
    pub ttl: Duration,
    pub scheme: String,
    pub cache_path: String,
    pub cache_map_size_mb: usize,
    pub serialize_per_key: bool,
    pub connect_timeout: Duration,
    pub timeout: Duration,
    pub max_body_bytes: Option<usize>,
    pub region: Option<RegionSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegionSettings {
    pub url: String,
    pub timeout: Duration,
}

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9090";
pub const DEFAULT_TTL_SECS: u64 = 3600;
pub const DEFAULT_SCHEME: &str = "http";
pub const DEFAULT_CACHE_PATH: &str = "regiond.db";
pub const DEFAULT_CACHE_MAP_SIZE_MB: usize = 64;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 500;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_REGION_TIMEOUT_MS: u64 = 500;

impl Config {
    /// Applies non-empty overrides on top of the file values.
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        let mut server = self.server.take().unwrap_or_default();
        if overrides.bind_addr.is_some() {
            server.bind_addr = overrides.bind_addr;
        }
        if overrides.metrics_addr.is_some() {
            server.metrics_addr = overrides.metrics_addr;
        }
        self.server = Some(server);

        let mut proxy = self.proxy.take().unwrap_or_default();
        if let Some(upstreams) = overrides.upstreams.filter(|u| !u.is_empty()) {
            proxy.upstreams = Some(upstreams);
        }
        if overrides.ttl_secs.is_some() {
            proxy.ttl_secs = overrides.ttl_secs;
        }
        if overrides.cache_path.is_some() {
            proxy.cache_path = overrides.cache_path;
        }
        self.proxy = Some(proxy);

        if let Some(url) = overrides.region_url {
            let timeout_ms = self.region.as_ref().and_then(|r| r.timeout_ms);
            self.region = Some(RegionConfig { url, timeout_ms });
        }

        self
    }

    /// Applies defaults, validates, and sanitizes the configuration.
    pub fn finalize(self) -> Result<Settings, ConfigError> {
        let server = self.server.unwrap_or_default();
        let proxy = self.proxy.unwrap_or_default();

        let scheme = proxy.scheme.unwrap_or_else(|| DEFAULT_SCHEME.to_string()).to_lowercase();
        if scheme != "http" && scheme != "https" {
            return Err(ConfigError::ConfigError(format!("Unsupported scheme: {}", scheme)));
        }

        let upstreams = validate_upstreams(proxy.upstreams.unwrap_or_default())?;

        let ttl_secs = proxy.ttl_secs.unwrap_or(DEFAULT_TTL_SECS);
        if ttl_secs == 0 {
            warn!("ttl_secs = 0 would make every assignment stale immediately, using 1");
        }

        let region = match self.region {
            Some(region) => Some(validate_region(region)?),
            None => None,
        };

        Ok(Settings {
            bind_addr: server.bind_addr.unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string()),
            metrics_addr: server.metrics_addr.filter(|a| !a.trim().is_empty()),
            upstreams,
            ttl: Duration::from_secs(ttl_secs.max(1)),
            scheme,
            cache_path: proxy.cache_path.unwrap_or_else(|| DEFAULT_CACHE_PATH.to_string()),
            cache_map_size_mb: proxy.cache_map_size_mb.unwrap_or(DEFAULT_CACHE_MAP_SIZE_MB).max(1),
            serialize_per_key: proxy.serialize_per_key.unwrap_or(false),
            connect_timeout: Duration::from_millis(
                proxy.connect_timeout_ms.unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
            ),
            timeout: Duration::from_secs(proxy.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS).max(1)),
            max_body_bytes: proxy.max_body_bytes.filter(|limit| *limit > 0),
            region,
        })
    }
}

pub fn try_load_config(path: &str) -> Result<Option<Config>, ConfigError> {
    match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<Config>(&raw) {
            Ok(cfg) => {
                info!(path = %path, "Loaded config");
                Ok(Some(cfg))
            }
            Err(e) => {
                error!(path = %path, error = %e, "Failed to parse config");
                Err(ConfigError::ConfigError(e.to_string()))
            }
        },
        Err(e) => {
            if e.kind() == std::io::ErrorKind::NotFound {
                info!(path = %path, "No config file found, using defaults");
                Ok(None)
            } else {
                Err(ConfigError::ConfigError(e.to_string()))
            }
        }
    }
}

/// Checks every `host:port` entry.
///
/// Invalid entries are an error rather than being skipped: dropping one would
/// shift the pool indices that region ordinals map onto. Duplicates are kept
/// for the same reason.
pub fn validate_upstreams(upstreams: Vec<String>) -> Result<Vec<String>, ConfigError> {
    const MAX_HOST_LEN: usize = 255 + 6;
    let mut seen = HashSet::new();

    let validated = upstreams
        .into_iter()
        .map(|u| {
            let u = u.trim().to_string();

            if u.is_empty() {
                return Err(ConfigError::ConfigError("Empty upstream entry".to_string()));
            }

            if u.contains("://") {
                return Err(ConfigError::ConfigError(format!(
                    "Upstream must be host:port without a scheme: {}",
                    u
                )));
            }

            if u.len() > MAX_HOST_LEN {
                return Err(ConfigError::ConfigError(format!("Upstream too long: {}", u)));
            }

            if u.chars().any(|c| c.is_control() || c.is_whitespace() || c == '/') {
                return Err(ConfigError::ConfigError(format!(
                    "Upstream contains invalid characters: {}",
                    u
                )));
            }

            if !seen.insert(u.clone()) {
                warn!(upstream = %u, "Duplicate upstream, it will receive a larger share");
            }

            Ok(u)
        })
        .collect::<Result<Vec<String>, ConfigError>>()?;

    if validated.is_empty() {
        return Err(ConfigError::ConfigError("No upstreams configured".to_string()));
    }

    Ok(validated)
}

fn validate_region(region: RegionConfig) -> Result<RegionSettings, ConfigError> {
    let url = region.url.trim().to_string();
    let lower = url.to_lowercase();
    if !lower.starts_with("http://") && !lower.starts_with("https://") {
        return Err(ConfigError::ConfigError(format!("Invalid region service URL: {}", url)));
    }
    Ok(RegionSettings {
        url,
        timeout: Duration::from_millis(
            region.timeout_ms.unwrap_or(DEFAULT_REGION_TIMEOUT_MS).max(1),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn with_upstreams(upstreams: &[&str]) -> Config {
        Config {
            proxy: Some(ProxyConfig {
                upstreams: Some(upstreams.iter().map(|s| s.to_string()).collect()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_try_load_config_valid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nbind_addr = \"127.0.0.1:8070\"").unwrap();
        let path = file.path().to_str().unwrap();
        let config = try_load_config(path).unwrap().unwrap();
        assert_eq!(config.server.unwrap().bind_addr.unwrap(), "127.0.0.1:8070");
    }

    #[test]
    fn test_try_load_config_file_not_found() {
        let result = try_load_config("nonexistent.toml").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_try_load_config_invalid_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[proxy]\nttl_secs = \"soon\"").unwrap();
        let path = file.path().to_str().unwrap();
        assert!(try_load_config(path).is_err());
    }

    #[test]
    fn test_full_file_finalizes() {
        let toml = r#"
        [server]
        bind_addr = "127.0.0.1:9000"
        metrics_addr = "127.0.0.1:9100"

        [proxy]
        upstreams = ["localhost:9091", "localhost:9092"]
        ttl_secs = 5
        cache_path = "/tmp/sticky.db"
        serialize_per_key = true
        max_body_bytes = 10485760

        [region]
        url = "http://regions.local/lookup"
        timeout_ms = 250
        "#;
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{}", toml).unwrap();
        let path = file.path().to_str().unwrap();

        let settings = try_load_config(path).unwrap().unwrap().finalize().unwrap();
        assert_eq!(settings.bind_addr, "127.0.0.1:9000");
        assert_eq!(settings.metrics_addr.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(settings.upstreams, vec!["localhost:9091", "localhost:9092"]);
        assert_eq!(settings.ttl, Duration::from_secs(5));
        assert_eq!(settings.cache_path, "/tmp/sticky.db");
        assert!(settings.serialize_per_key);
        assert_eq!(settings.max_body_bytes, Some(10 * 1024 * 1024));
        let region = settings.region.unwrap();
        assert_eq!(region.url, "http://regions.local/lookup");
        assert_eq!(region.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_defaults_applied() {
        let settings = with_upstreams(&["a:1"]).finalize().unwrap();
        assert_eq!(settings.bind_addr, DEFAULT_BIND_ADDR);
        assert!(settings.metrics_addr.is_none());
        assert_eq!(settings.ttl, Duration::from_secs(DEFAULT_TTL_SECS));
        assert_eq!(settings.scheme, "http");
        assert_eq!(settings.cache_path, DEFAULT_CACHE_PATH);
        assert_eq!(settings.cache_map_size_mb, DEFAULT_CACHE_MAP_SIZE_MB);
        assert!(!settings.serialize_per_key);
        assert_eq!(settings.timeout, Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert!(settings.max_body_bytes.is_none());
        assert!(settings.region.is_none());
    }

    #[test]
    fn test_zero_body_limit_means_unlimited() {
        let mut cfg = with_upstreams(&["a:1"]);
        cfg.proxy.as_mut().unwrap().max_body_bytes = Some(0);
        assert!(cfg.finalize().unwrap().max_body_bytes.is_none());
    }

    #[test]
    fn test_missing_upstreams_is_an_error() {
        let result = Config::default().finalize();
        assert!(matches!(
            result,
            Err(ConfigError::ConfigError(msg)) if msg == "No upstreams configured"
        ));
    }

    #[test]
    fn test_invalid_upstream_is_an_error() {
        assert!(with_upstreams(&["a:1", "http://b:2"]).finalize().is_err());
        assert!(with_upstreams(&["a:1", "  "]).finalize().is_err());
        assert!(with_upstreams(&["a:1/path"]).finalize().is_err());
        assert!(with_upstreams(&["a :1"]).finalize().is_err());
    }

    #[test]
    fn test_upstreams_are_trimmed_and_keep_order_and_duplicates() {
        let validated =
            validate_upstreams(vec![" b:2 ".into(), "a:1".into(), "b:2".into()]).unwrap();
        assert_eq!(validated, vec!["b:2", "a:1", "b:2"]);
    }

    #[test]
    fn test_ttl_zero_is_clamped() {
        let mut cfg = with_upstreams(&["a:1"]);
        cfg.proxy.as_mut().unwrap().ttl_secs = Some(0);
        assert_eq!(cfg.finalize().unwrap().ttl, Duration::from_secs(1));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let mut cfg = with_upstreams(&["a:1"]);
        cfg.proxy.as_mut().unwrap().scheme = Some("ftp".into());
        assert!(cfg.finalize().is_err());

        let mut cfg = with_upstreams(&["a:1"]);
        cfg.proxy.as_mut().unwrap().scheme = Some("HTTPS".into());
        assert_eq!(cfg.finalize().unwrap().scheme, "https");
    }

    #[test]
    fn test_invalid_region_url_is_rejected() {
        let mut cfg = with_upstreams(&["a:1"]);
        cfg.region = Some(RegionConfig { url: "regions.local".into(), timeout_ms: None });
        assert!(cfg.finalize().is_err());
    }

    #[test]
    fn test_overrides_take_precedence() {
        let cfg = with_upstreams(&["a:1"]).with_overrides(Overrides {
            upstreams: Some(vec!["x:1".into(), "y:2".into()]),
            ttl_secs: Some(60),
            cache_path: Some("/tmp/other.db".into()),
            bind_addr: Some("127.0.0.1:1234".into()),
            metrics_addr: None,
            region_url: Some("https://regions.local".into()),
        });
        let settings = cfg.finalize().unwrap();
        assert_eq!(settings.upstreams, vec!["x:1", "y:2"]);
        assert_eq!(settings.ttl, Duration::from_secs(60));
        assert_eq!(settings.cache_path, "/tmp/other.db");
        assert_eq!(settings.bind_addr, "127.0.0.1:1234");
        assert_eq!(
            settings.region,
            Some(RegionSettings {
                url: "https://regions.local".into(),
                timeout: Duration::from_millis(DEFAULT_REGION_TIMEOUT_MS),
            })
        );
    }

    #[test]
    fn test_empty_override_keeps_file_upstreams() {
        let cfg = with_upstreams(&["a:1"])
            .with_overrides(Overrides { upstreams: Some(Vec::new()), ..Default::default() });
        assert_eq!(cfg.finalize().unwrap().upstreams, vec!["a:1"]);
    }

    #[test]
    fn test_try_load_empty_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file).unwrap();
        let path = file.path().to_str().unwrap();
        let cfg = try_load_config(path).unwrap().unwrap();
        assert!(cfg.server.is_none());
        assert!(cfg.proxy.is_none());
        assert!(cfg.region.is_none());
    }
}
