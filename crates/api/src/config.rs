//! Server configuration
//!
//! Everything is read from the environment (after `dotenvy` has loaded a
//! `.env` file, if any). Required values fail startup with a named error.

use std::path::PathBuf;

use crate::storage::CloudinaryConfig;

const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_APP_URL: &str = "http://localhost:3000";
const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_JWT_EXPIRY_HOURS: i64 = 24 * 7;
const DEFAULT_UPLOAD_MAX_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_UPLOAD_DIR: &str = "uploads";
const MIN_JWT_SECRET_LEN: usize = 32;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Where uploaded files go
#[derive(Debug, Clone)]
pub enum UploadBackend {
    Cloudinary(CloudinaryConfig),
    Local { dir: PathBuf, public_url: String },
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub backend: UploadBackend,
    pub max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    /// Direct (non-pooled) connection used for migrations
    pub database_direct_url: Option<String>,
    pub run_migrations: bool,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    /// Frontend base URL, used in emails and redirects
    pub app_url: String,
    /// Public base URL of this server
    pub api_url: String,
    pub allowed_origins: Vec<String>,
    pub cookie_secure: bool,
    /// Card-less trial granted at sign-up, 0 disables it
    pub signup_trial_days: u32,
    pub enable_billing: bool,
    pub upload: UploadConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let jwt_secret = get("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;
        if jwt_secret.len() < MIN_JWT_SECRET_LEN {
            return Err(ConfigError::Invalid {
                name: "JWT_SECRET",
                reason: format!("must be at least {MIN_JWT_SECRET_LEN} characters"),
            });
        }

        let jwt_expiry_hours = parse_or(get("JWT_EXPIRY_HOURS"), "JWT_EXPIRY_HOURS", DEFAULT_JWT_EXPIRY_HOURS)?;
        if jwt_expiry_hours <= 0 {
            return Err(ConfigError::Invalid {
                name: "JWT_EXPIRY_HOURS",
                reason: "must be positive".to_string(),
            });
        }

        let app_url = trim_url(get("APP_URL").unwrap_or_else(|| DEFAULT_APP_URL.to_string()));
        let api_url = trim_url(get("API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()));
        for (name, value) in [("APP_URL", &app_url), ("API_URL", &api_url)] {
            url::Url::parse(value).map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
            })?;
        }

        let allowed_origins = match get("ALLOWED_ORIGINS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => vec![app_url.clone()],
        };

        let cookie_secure = match get("COOKIE_SECURE") {
            Some(v) => parse_bool(&v, "COOKIE_SECURE")?,
            None => app_url.starts_with("https://"),
        };

        let run_migrations = match get("RUN_MIGRATIONS") {
            Some(v) => parse_bool(&v, "RUN_MIGRATIONS")?,
            None => false,
        };

        let enable_billing = match get("ENABLE_BILLING") {
            Some(v) => parse_bool(&v, "ENABLE_BILLING")?,
            None => true,
        };

        Ok(Self {
            bind_address: get("BIND_ADDRESS").unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            database_url,
            database_direct_url: get("DATABASE_DIRECT_URL"),
            run_migrations,
            jwt_secret,
            jwt_expiry_hours,
            app_url,
            api_url: api_url.clone(),
            allowed_origins,
            cookie_secure,
            signup_trial_days: parse_or(get("SIGNUP_TRIAL_DAYS"), "SIGNUP_TRIAL_DAYS", 0)?,
            enable_billing,
            upload: upload_config(&get, &api_url)?,
        })
    }
}

fn upload_config<G>(get: &G, api_url: &str) -> Result<UploadConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let max_bytes = parse_or(get("UPLOAD_MAX_BYTES"), "UPLOAD_MAX_BYTES", DEFAULT_UPLOAD_MAX_BYTES)?;
    let provider = get("UPLOAD_PROVIDER").unwrap_or_else(|| "local".to_string());

    let backend = match provider.to_ascii_lowercase().as_str() {
        "cloudinary" => UploadBackend::Cloudinary(CloudinaryConfig {
            cloud_name: get("CLOUDINARY_CLOUD_NAME")
                .ok_or(ConfigError::Missing("CLOUDINARY_CLOUD_NAME"))?,
            api_key: get("CLOUDINARY_API_KEY").ok_or(ConfigError::Missing("CLOUDINARY_API_KEY"))?,
            api_secret: get("CLOUDINARY_API_SECRET")
                .ok_or(ConfigError::Missing("CLOUDINARY_API_SECRET"))?,
            base_url: get("CLOUDINARY_API_BASE_URL")
                .map(trim_url)
                .unwrap_or_else(|| CloudinaryConfig::DEFAULT_BASE_URL.to_string()),
        }),
        "local" => UploadBackend::Local {
            dir: PathBuf::from(get("UPLOAD_DIR").unwrap_or_else(|| DEFAULT_UPLOAD_DIR.to_string())),
            public_url: get("UPLOAD_PUBLIC_URL")
                .map(trim_url)
                .unwrap_or_else(|| format!("{api_url}/uploads")),
        },
        other => {
            return Err(ConfigError::Invalid {
                name: "UPLOAD_PROVIDER",
                reason: format!("unknown provider '{other}' (expected cloudinary or local)"),
            })
        }
    };

    Ok(UploadConfig { backend, max_bytes })
}

fn parse_or<T: std::str::FromStr>(
    value: Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("'{v}' is not a valid number"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(value: &str, name: &'static str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("'{other}' is not a boolean"),
        }),
    }
}

fn trim_url(url: String) -> String {
    url.trim_end_matches('/').to_string()
}
