use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const APP_DIR: &str = "gpuwatchd";
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub listen: String,
    pub nvidia_smi_path: String,
    pub ollama_path: String,
    pub gpu_sample_db: String,
    #[serde(with = "humantime_duration")]
    pub gpu_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub service_interval: Duration,
    #[serde(with = "humantime_duration")]
    pub service_timeout: Duration,
    pub history_default_range_secs: u64,
    pub endpoints: Vec<ServiceEndpoint>,
}

/// An inference server whose `/api/ps` is polled and whose models can be
/// stopped through `OLLAMA_HOST`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:23333".to_string(),
            nvidia_smi_path: "nvidia-smi".to_string(),
            ollama_path: "ollama".to_string(),
            gpu_sample_db: default_db_path().display().to_string(),
            gpu_interval: Duration::from_millis(500),
            service_interval: Duration::from_millis(500),
            service_timeout: Duration::from_secs(2),
            history_default_range_secs: 120,
            endpoints: vec![ServiceEndpoint {
                name: "local".to_string(),
                url: "http://127.0.0.1:11434".to_string(),
            }],
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to write config file {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("failed to serialize config: {0}")]
    Serialize(#[source] serde_yaml::Error),
    #[error("config validation failed: {0}")]
    Validation(String),
    #[error("unknown config key '{0}'")]
    UnknownKey(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`Config::load_from_file`], but a missing file yields the defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if !path_ref.exists() {
            return Ok(Self::default());
        }
        Self::load_from_file(path_ref)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = serde_yaml::to_string(self).map_err(ConfigError::Serialize)?;

        if let Some(dir) = path_ref.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: path_display.clone(),
                source,
            })?;
        }
        fs::write(path_ref, text).map_err(|source| ConfigError::Write {
            path: path_display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation("listen is required".to_string()));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "listen must be a host:port socket address".to_string(),
            ));
        }
        if self.nvidia_smi_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "nvidia_smi_path must not be empty".to_string(),
            ));
        }
        if self.ollama_path.trim().is_empty() {
            return Err(ConfigError::Validation(
                "ollama_path must not be empty".to_string(),
            ));
        }
        if self.gpu_sample_db.trim().is_empty() {
            return Err(ConfigError::Validation(
                "gpu_sample_db must not be empty".to_string(),
            ));
        }
        if self.gpu_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::Validation(
                "gpu_interval must be >= 100ms".to_string(),
            ));
        }
        if self.service_interval < MIN_POLL_INTERVAL {
            return Err(ConfigError::Validation(
                "service_interval must be >= 100ms".to_string(),
            ));
        }
        if self.service_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "service_timeout must be > 0".to_string(),
            ));
        }

        validate_endpoints(&self.endpoints)
    }

    /// Endpoint used for model control and API pass-through when a request
    /// does not name one.
    pub fn default_endpoint(&self) -> Option<&ServiceEndpoint> {
        self.endpoints.first()
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_endpoints(endpoints: &[ServiceEndpoint]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for endpoint in endpoints {
        if endpoint.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "endpoints[*].name must not be empty".to_string(),
            ));
        }
        if !names.insert(endpoint.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "endpoint name '{}' must be unique",
                endpoint.name
            )));
        }
        if !endpoint.url.starts_with("http://") && !endpoint.url.starts_with("https://") {
            return Err(ConfigError::Validation(format!(
                "endpoint '{}' url {} must start with http:// or https://",
                endpoint.name, endpoint.url
            )));
        }
    }
    Ok(())
}

pub fn default_app_dir() -> PathBuf {
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

pub fn default_config_path() -> PathBuf {
    default_app_dir().join("server.yaml")
}

pub fn default_db_path() -> PathBuf {
    default_app_dir().join(".gpu_sample")
}

type Getter = fn(&Config) -> String;
type Setter = fn(&mut Config, &str) -> Result<(), String>;

/// String-keyed accessors for `config get` / `config set`.
pub struct ConfigRegistry {
    keys: BTreeMap<&'static str, (Getter, Setter)>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        let mut keys: BTreeMap<&'static str, (Getter, Setter)> = BTreeMap::new();
        keys.insert(
            "listen",
            (
                |c| c.listen.clone(),
                |c, v| {
                    c.listen = v.to_string();
                    Ok(())
                },
            ),
        );
        keys.insert(
            "nvidia_smi_path",
            (
                |c| c.nvidia_smi_path.clone(),
                |c, v| {
                    c.nvidia_smi_path = v.to_string();
                    Ok(())
                },
            ),
        );
        keys.insert(
            "ollama_path",
            (
                |c| c.ollama_path.clone(),
                |c, v| {
                    c.ollama_path = v.to_string();
                    Ok(())
                },
            ),
        );
        keys.insert(
            "gpu_sample_db",
            (
                |c| c.gpu_sample_db.clone(),
                |c, v| {
                    c.gpu_sample_db = v.to_string();
                    Ok(())
                },
            ),
        );
        keys.insert(
            "gpu_interval",
            (
                |c| humantime::format_duration(c.gpu_interval).to_string(),
                |c, v| {
                    c.gpu_interval = parse_duration(v)?;
                    Ok(())
                },
            ),
        );
        keys.insert(
            "service_interval",
            (
                |c| humantime::format_duration(c.service_interval).to_string(),
                |c, v| {
                    c.service_interval = parse_duration(v)?;
                    Ok(())
                },
            ),
        );
        keys.insert(
            "service_timeout",
            (
                |c| humantime::format_duration(c.service_timeout).to_string(),
                |c, v| {
                    c.service_timeout = parse_duration(v)?;
                    Ok(())
                },
            ),
        );
        keys.insert(
            "history_default_range_secs",
            (
                |c| c.history_default_range_secs.to_string(),
                |c, v| {
                    c.history_default_range_secs =
                        v.trim().parse().map_err(|e| format!("{e}"))?;
                    Ok(())
                },
            ),
        );
        keys.insert(
            "endpoints",
            (
                |c| {
                    c.endpoints
                        .iter()
                        .map(|e| format!("{}={}", e.name, e.url))
                        .collect::<Vec<_>>()
                        .join(",")
                },
                |c, v| {
                    c.endpoints = parse_endpoint_list(v);
                    Ok(())
                },
            ),
        );
        Self { keys }
    }

    pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.keys.keys().copied()
    }

    pub fn get(&self, cfg: &Config, key: &str) -> Result<String, ConfigError> {
        let (getter, _) = self.lookup(key)?;
        Ok(getter(cfg))
    }

    pub fn set(&self, cfg: &mut Config, key: &str, value: &str) -> Result<(), ConfigError> {
        let (_, setter) = self.lookup(key)?;
        setter(cfg, value).map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            reason,
        })
    }

    fn lookup(&self, key: &str) -> Result<(Getter, Setter), ConfigError> {
        let normalized = key.trim().to_ascii_lowercase();
        if normalized == "ollama_listen" {
            return Err(ConfigError::Validation(
                "ollama_listen is deprecated, use endpoints".to_string(),
            ));
        }
        self.keys
            .get(normalized.as_str())
            .copied()
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value.trim()).map_err(|e| e.to_string())
}

/// `name=url` pairs or bare URLs, comma separated. A bare URL is its own name.
fn parse_endpoint_list(value: &str) -> Vec<ServiceEndpoint> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| match item.split_once('=') {
            Some((name, url)) => ServiceEndpoint {
                name: name.trim().to_string(),
                url: url.trim().to_string(),
            },
            None => ServiceEndpoint {
                name: item.to_string(),
                url: item.to_string(),
            },
        })
        .collect()
}

mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        humantime::parse_duration(text.trim()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            listen: "127.0.0.1:23333".to_string(),
            gpu_sample_db: "/tmp/gpuwatchd-test".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().expect("defaults must validate");
    }

    #[test]
    fn example_yaml_parses_and_validates() {
        let cfg: Config = serde_yaml::from_str(Config::example_yaml()).expect("example parses");
        cfg.validate().expect("example validates");
        assert_eq!(cfg.gpu_interval, Duration::from_millis(500));
        assert_eq!(cfg.endpoints.len(), 1);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let cfg: Config = serde_yaml::from_str(
            "listen: \"127.0.0.1:9000\"\ngpu_interval: 250ms\nendpoints:\n  - name: a\n    url: http://10.0.0.2:11434\n  - name: b\n    url: http://10.0.0.3:11434\n",
        )
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.gpu_interval, Duration::from_millis(250));
        assert_eq!(cfg.service_timeout, Duration::from_secs(2));
        assert_eq!(cfg.ollama_path, "ollama");
        assert_eq!(cfg.default_endpoint().unwrap().name, "a");
    }

    #[test]
    fn rejects_endpoint_without_scheme() {
        let mut cfg = valid_config();
        cfg.endpoints = vec![ServiceEndpoint {
            name: "box".to_string(),
            url: "127.0.0.1:11434".to_string(),
        }];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_duplicate_endpoint_names() {
        let mut cfg = valid_config();
        let endpoint = ServiceEndpoint {
            name: "box".to_string(),
            url: "http://127.0.0.1:11434".to_string(),
        };
        cfg.endpoints = vec![endpoint.clone(), endpoint];
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn rejects_too_fast_polling() {
        let mut cfg = valid_config();
        cfg.gpu_interval = Duration::from_millis(10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(cfg.listen, Config::default().listen);
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("server.yaml");
        let mut cfg = valid_config();
        cfg.service_interval = Duration::from_secs(1);
        cfg.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.service_interval, Duration::from_secs(1));
        assert_eq!(loaded.gpu_sample_db, "/tmp/gpuwatchd-test");
        assert_eq!(loaded.endpoints, cfg.endpoints);
    }

    #[test]
    fn registry_round_trips_typed_values() {
        let registry = ConfigRegistry::new();
        let mut cfg = valid_config();

        registry.set(&mut cfg, "gpu_interval", "750ms").unwrap();
        assert_eq!(cfg.gpu_interval, Duration::from_millis(750));
        assert_eq!(registry.get(&cfg, "gpu_interval").unwrap(), "750ms");

        registry
            .set(&mut cfg, "History_Default_Range_Secs", "600")
            .unwrap();
        assert_eq!(cfg.history_default_range_secs, 600);

        let err = registry
            .set(&mut cfg, "history_default_range_secs", "ten")
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn registry_parses_endpoint_lists() {
        let registry = ConfigRegistry::new();
        let mut cfg = valid_config();
        registry
            .set(
                &mut cfg,
                "endpoints",
                "gpu0=http://127.0.0.1:11434, http://10.0.0.5:11434",
            )
            .unwrap();
        assert_eq!(cfg.endpoints.len(), 2);
        assert_eq!(cfg.endpoints[0].name, "gpu0");
        assert_eq!(cfg.endpoints[1].name, "http://10.0.0.5:11434");
        cfg.validate().unwrap();
        assert_eq!(
            registry.get(&cfg, "endpoints").unwrap(),
            "gpu0=http://127.0.0.1:11434,http://10.0.0.5:11434=http://10.0.0.5:11434"
        );
    }

    #[test]
    fn registry_rejects_unknown_and_deprecated_keys() {
        let registry = ConfigRegistry::new();
        let mut cfg = valid_config();
        assert!(matches!(
            registry.get(&cfg, "alerts.enabled"),
            Err(ConfigError::UnknownKey(_))
        ));
        assert!(matches!(
            registry.set(&mut cfg, "ollama_listen", "http://x"),
            Err(ConfigError::Validation(_))
        ));
    }
}
