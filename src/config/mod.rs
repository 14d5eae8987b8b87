//! Configuration for the KV-cache proxy.
//!
//! Unlike a multi-tenant gateway with a TOML settings file, this proxy has a
//! single owner process and a small, flat set of knobs, so it is configured
//! entirely from environment variables (§6) and read exactly once at startup
//! into an immutable [`Config`]. There is no hot reload and no remote config
//! service: a malformed environment is a fatal startup error, not a runtime
//! fallback.

use std::{env, time::Duration};

use serde::Deserialize;
use thiserror::Error;

/// One backend inference server and the number of KV slots it exposes.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub n_slots: usize,
}

/// Fully resolved, immutable process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub backends: Vec<BackendConfig>,
    pub words_per_block: usize,
    pub big_threshold_words: usize,
    pub lcp_threshold: f64,
    pub meta_dir: std::path::PathBuf,
    pub request_timeout: Duration,
    pub acquire_timeout: Duration,
    pub model_id: String,
    pub port: u16,
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BACKENDS is not valid JSON: {0}")]
    InvalidBackendsJson(serde_json::Error),
    #[error("BACKENDS must be a non-empty array of {{url, n_slots}}")]
    EmptyBackends,
    #[error("invalid value for {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        source: std::num::ParseIntError,
    },
    #[error("invalid value for {var}: {source}")]
    InvalidFloat {
        var: &'static str,
        source: std::num::ParseFloatError,
    },
}

fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn parse_usize(var: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { var, source }),
        Err(_) => Ok(default),
    }
}

fn parse_f64(var: &'static str, default: f64) -> Result<f64, ConfigError> {
    match env::var(var) {
        Ok(v) => v
            .parse()
            .map_err(|source| ConfigError::InvalidFloat { var, source }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `BACKENDS` (a JSON array of `{"url","n_slots"}`) takes precedence;
    /// otherwise a single backend is assembled from `LLAMA_URL`/`N_SLOTS`,
    /// mirroring the fallback in the source this proxy is modeled on.
    pub fn from_env() -> Result<Self, ConfigError> {
        let backends = match env::var("BACKENDS") {
            Ok(raw) => {
                let parsed: Vec<BackendConfig> =
                    serde_json::from_str(&raw).map_err(ConfigError::InvalidBackendsJson)?;
                if parsed.is_empty() {
                    return Err(ConfigError::EmptyBackends);
                }
                parsed
            }
            Err(_) => {
                let url = env_or("LLAMA_URL", "http://127.0.0.1:8000");
                let n_slots = parse_usize("N_SLOTS", 2)?;
                vec![BackendConfig { url, n_slots }]
            }
        };

        let words_per_block = parse_usize("WORDS_PER_BLOCK", 100)?;
        let big_threshold_words = parse_usize("BIG_THRESHOLD_WORDS", 500)?;
        let lcp_threshold = parse_f64("LCP_TH", 0.6)?;
        let meta_dir = std::path::PathBuf::from(env_or("META_DIR", "kv_meta"));
        let request_timeout_secs = parse_usize("REQUEST_TIMEOUT", 600)? as u64;
        let acquire_timeout_secs = parse_usize("ACQUIRE_TIMEOUT", 300)? as u64;
        let model_id = env_or("MODEL_ID", "llama.cpp");
        let port = parse_usize("PORT", 8081)? as u16;
        let log_level = env_or("LOG_LEVEL", "info");

        Ok(Self {
            backends,
            words_per_block,
            big_threshold_words,
            lcp_threshold,
            meta_dir,
            request_timeout: Duration::from_secs(request_timeout_secs),
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            model_id,
            port,
            log_level,
        })
    }

    /// Total number of KV slots across all backends.
    pub fn total_slots(&self) -> usize {
        self.backends.iter().map(|b| b.n_slots).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Environment variables are process-global, so tests that touch them run
    // under a single mutex to avoid interleaving.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for var in [
            "BACKENDS",
            "LLAMA_URL",
            "N_SLOTS",
            "WORDS_PER_BLOCK",
            "BIG_THRESHOLD_WORDS",
            "LCP_TH",
            "META_DIR",
            "REQUEST_TIMEOUT",
            "ACQUIRE_TIMEOUT",
            "MODEL_ID",
            "PORT",
            "LOG_LEVEL",
        ] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        let config = Config::from_env().unwrap();
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].url, "http://127.0.0.1:8000");
        assert_eq!(config.backends[0].n_slots, 2);
        assert_eq!(config.words_per_block, 100);
        assert_eq!(config.big_threshold_words, 500);
        assert!((config.lcp_threshold - 0.6).abs() < f64::EPSILON);
        assert_eq!(config.port, 8081);
        assert_eq!(config.model_id, "llama.cpp");
    }

    #[test]
    fn backends_json_overrides_fallback_pair() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(
                "BACKENDS",
                r#"[{"url":"http://a:1","n_slots":3},{"url":"http://b:1","n_slots":1}]"#,
            );
        }
        let config = Config::from_env().unwrap();
        assert_eq!(config.total_slots(), 4);
        clear_env();
    }

    #[test]
    fn malformed_backends_json_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { env::set_var("BACKENDS", "not json") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBackendsJson(_)));
        clear_env();
    }

    #[test]
    fn empty_backends_array_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_env();
        unsafe { env::set_var("BACKENDS", "[]") };
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::EmptyBackends));
        clear_env();
    }
}
