use crate::token::{Cipher, CryptoError, TokenCodec};
use anyhow::{Context, Result, anyhow};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    pub cipher: Cipher,
    pub cipher_iv: String,
    pub cipher_key: String,
    pub use_cache: bool,
    pub fallback_image: Option<PathBuf>,
    pub processor_bin: PathBuf,
    pub processor_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_source_bytes: u64,
    pub additional_transformations: Vec<String>,
    pub max_in_flight_requests: usize,
    pub failure_log_path: Option<PathBuf>,
    pub failure_log_max_bytes: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = parse_u16("PORT", 8080);
        let storage_dir = PathBuf::from(
            env::var("STORAGE_DIR").unwrap_or_else(|_| "/var/cache/image-gateway".to_string()),
        );

        let cipher = cipher_from_env()?;
        let cipher_iv = env::var("CIPHER_IV").context("CIPHER_IV is required")?;
        let cipher_key = env::var("CIPHER_KEY").context("CIPHER_KEY is required")?;

        let use_cache = parse_bool("USE_CACHE", true);
        let fallback_image = parse_optional_path("FALLBACK_IMAGE");
        let processor_bin = PathBuf::from(
            env::var("IMAGEMAGICK_BIN")
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "convert".to_string()),
        );
        let processor_timeout =
            Duration::from_secs(parse_u64("PROCESSOR_TIMEOUT_SECONDS", 60).max(1));
        let fetch_timeout = Duration::from_secs(parse_u64("FETCH_TIMEOUT_SECONDS", 30).max(1));
        let max_source_bytes = parse_u64("MAX_SOURCE_BYTES", 50 * 1024 * 1024);
        let additional_transformations =
            parse_list_env("ADDITIONAL_TRANSFORMATIONS").unwrap_or_default();
        let max_in_flight_requests = parse_usize("MAX_IN_FLIGHT_REQUESTS", 256);
        let failure_log_path = parse_optional_path("FAILURE_LOG_PATH");
        let failure_log_max_bytes = parse_u64("FAILURE_LOG_MAX_BYTES", 102_400);

        if !use_cache && !additional_transformations.is_empty() {
            warn!(
                additional = ?additional_transformations,
                "ADDITIONAL_TRANSFORMATIONS requires USE_CACHE=true; every request will fall back"
            );
        }

        let config = Self {
            host,
            port,
            storage_dir,
            cipher,
            cipher_iv,
            cipher_key,
            use_cache,
            fallback_image,
            processor_bin,
            processor_timeout,
            fetch_timeout,
            max_source_bytes,
            additional_transformations,
            max_in_flight_requests,
            failure_log_path,
            failure_log_max_bytes,
        };
        config
            .token_codec()
            .map_err(|err| anyhow!("invalid cipher configuration: {err}"))?;
        Ok(config)
    }

    pub fn token_codec(&self) -> Result<TokenCodec, CryptoError> {
        TokenCodec::new(self.cipher, &self.cipher_iv, self.cipher_key.as_bytes())
    }
}

pub fn cipher_from_env() -> Result<Cipher> {
    match env::var("CIPHER") {
        Ok(value) if !value.trim().is_empty() => value
            .parse::<Cipher>()
            .map_err(|err| anyhow!("invalid CIPHER: {err}")),
        _ => Ok(Cipher::default()),
    }
}

fn parse_u16(key: &str, default: u16) -> u16 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn parse_optional_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("off"))
        .map(PathBuf::from)
}

fn parse_list_env(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    if raw.trim_start().starts_with('[') {
        serde_json::from_str(&raw).ok()
    } else {
        let list = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect::<Vec<_>>();
        if list.is_empty() { None } else { Some(list) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const KEYS: [&str; 8] = [
        "CIPHER",
        "CIPHER_IV",
        "CIPHER_KEY",
        "USE_CACHE",
        "FALLBACK_IMAGE",
        "ADDITIONAL_TRANSFORMATIONS",
        "FAILURE_LOG_PATH",
        "STORAGE_DIR",
    ];

    fn with_env_lock<F: FnOnce()>(f: F) {
        let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
        let _guard = lock.lock().unwrap_or_else(|err| err.into_inner());
        for key in KEYS {
            unsafe { env::remove_var(key) };
        }
        f();
        for key in KEYS {
            unsafe { env::remove_var(key) };
        }
    }

    fn set_valid_cipher() {
        unsafe { env::set_var("CIPHER_IV", "ZmVkY2JhOTg3NjU0MzIxMA==") };
        unsafe { env::set_var("CIPHER_KEY", "0123456789abcdef0123456789abcdef") };
    }

    #[test]
    fn parse_list_env_csv() {
        with_env_lock(|| {
            unsafe { env::set_var("ADDITIONAL_TRANSFORMATIONS", "thumb-100, large , ,source") };
            let list = parse_list_env("ADDITIONAL_TRANSFORMATIONS").unwrap();
            assert_eq!(list, vec!["thumb-100", "large", "source"]);
        });
    }

    #[test]
    fn parse_list_env_json() {
        with_env_lock(|| {
            unsafe { env::set_var("ADDITIONAL_TRANSFORMATIONS", r#"["w-10-h-20","large"]"#) };
            let list = parse_list_env("ADDITIONAL_TRANSFORMATIONS").unwrap();
            assert_eq!(list, vec!["w-10-h-20", "large"]);
        });
    }

    #[test]
    fn from_env_requires_cipher_material() {
        with_env_lock(|| {
            assert!(Config::from_env().is_err());
            unsafe { env::set_var("CIPHER_IV", "ZmVkY2JhOTg3NjU0MzIxMA==") };
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn from_env_rejects_wrong_key_length() {
        with_env_lock(|| {
            set_valid_cipher();
            unsafe { env::set_var("CIPHER_KEY", "too-short") };
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn from_env_applies_defaults() {
        with_env_lock(|| {
            set_valid_cipher();
            let config = Config::from_env().unwrap();
            assert_eq!(config.cipher, Cipher::Aes256Cfb);
            assert!(config.use_cache);
            assert_eq!(config.fallback_image, None);
            assert_eq!(config.processor_bin, PathBuf::from("convert"));
            assert!(config.additional_transformations.is_empty());
            assert_eq!(config.failure_log_path, None);
            assert!(config.token_codec().is_ok());
        });
    }

    #[test]
    fn from_env_reads_overrides() {
        with_env_lock(|| {
            set_valid_cipher();
            unsafe { env::set_var("CIPHER", "aes-128-cfb") };
            unsafe { env::set_var("CIPHER_KEY", "0123456789abcdef") };
            unsafe { env::set_var("USE_CACHE", "false") };
            unsafe { env::set_var("FALLBACK_IMAGE", "/srv/fallback.jpg") };
            unsafe { env::set_var("STORAGE_DIR", "/tmp/images") };
            let config = Config::from_env().unwrap();
            assert_eq!(config.cipher, Cipher::Aes128Cfb);
            assert!(!config.use_cache);
            assert_eq!(
                config.fallback_image,
                Some(PathBuf::from("/srv/fallback.jpg"))
            );
            assert_eq!(config.storage_dir, PathBuf::from("/tmp/images"));
        });
    }

    #[test]
    fn cipher_from_env_rejects_unknown_cipher() {
        with_env_lock(|| {
            unsafe { env::set_var("CIPHER", "des-ede3") };
            assert!(cipher_from_env().is_err());
        });
    }
}
