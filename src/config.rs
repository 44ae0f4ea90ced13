use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `TIMETABLED_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "timetabled".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: crate::engine::DEFAULT_LOCK_TIMEOUT,
            metrics_port: None,
            tls: None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    TlsIncomplete,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::TlsIncomplete => write!(
                f,
                "both TIMETABLED_TLS_CERT and TIMETABLED_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build a config from an arbitrary variable source. Unset variables take
    /// their defaults; set but malformed ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let lock_timeout_ms: Option<u64> = parsed(&lookup, "TIMETABLED_LOCK_TIMEOUT_MS")?;
        let max_connections = parsed(&lookup, "TIMETABLED_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "TIMETABLED_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        let tls = match (lookup("TIMETABLED_TLS_CERT"), lookup("TIMETABLED_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsIncomplete),
        };

        Ok(Self {
            bind: lookup("TIMETABLED_BIND").unwrap_or(defaults.bind),
            port: parsed(&lookup, "TIMETABLED_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("TIMETABLED_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: lookup("TIMETABLED_PASSWORD").unwrap_or(defaults.password),
            max_connections,
            compact_threshold: parsed(&lookup, "TIMETABLED_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            lock_timeout: lock_timeout_ms.map_or(defaults.lock_timeout, Duration::from_millis),
            metrics_port: parsed(&lookup, "TIMETABLED_METRICS_PORT")?,
            tls,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}
