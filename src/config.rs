use base64::{engine::general_purpose::STANDARD, Engine as _};
use tower_sessions::cookie::Key;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("SESSION_SECRET must be base64 encoding at least 64 bytes")]
    SessionSecret,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub listen_addr: String,
    /// Prefix used when building public share links, e.g. `https://todo.example.com`.
    pub public_base_url: String,
    /// Base64 signing secret for session cookies. A random key is used when unset,
    /// which logs everybody out on restart.
    pub session_secret: Option<String>,
    pub secure_cookies: bool,
    pub items_per_page: i64,
    pub remember_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite://todo.db".to_string(),
            listen_addr: "0.0.0.0:3000".to_string(),
            public_base_url: "http://localhost:3000".to_string(),
            session_secret: None,
            secure_cookies: false,
            items_per_page: 10,
            remember_days: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            public_base_url: lookup("PUBLIC_BASE_URL").unwrap_or(defaults.public_base_url),
            session_secret: lookup("SESSION_SECRET").filter(|s| !s.trim().is_empty()),
            secure_cookies: match lookup("SECURE_COOKIES") {
                Some(value) => parse_bool("SECURE_COOKIES", value)?,
                None => defaults.secure_cookies,
            },
            items_per_page: match lookup("ITEMS_PER_PAGE") {
                Some(value) => parse_positive("ITEMS_PER_PAGE", value)?,
                None => defaults.items_per_page,
            },
            remember_days: match lookup("REMEMBER_DAYS") {
                Some(value) => parse_positive("REMEMBER_DAYS", value)?,
                None => defaults.remember_days,
            },
        })
    }

    pub fn session_key(&self) -> Result<Key, ConfigError> {
        match &self.session_secret {
            None => Ok(Key::generate()),
            Some(secret) => {
                let bytes = STANDARD
                    .decode(secret.trim())
                    .map_err(|_| ConfigError::SessionSecret)?;
                Key::try_from(bytes.as_slice()).map_err(|_| ConfigError::SessionSecret)
            }
        }
    }

    pub fn share_url(&self, token: &str) -> String {
        format!(
            "{}/shared/task/{}",
            self.public_base_url.trim_end_matches('/'),
            token
        )
    }
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

fn parse_positive(var: &'static str, value: String) -> Result<i64, ConfigError> {
    match value.trim().parse::<i64>() {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.items_per_page, 10);
        assert_eq!(config.remember_days, 30);
        assert_eq!(config.listen_addr, "0.0.0.0:3000");
        assert!(!config.secure_cookies);
        assert!(config.session_secret.is_none());
    }

    #[test]
    fn rejects_zero_page_size() {
        let err = config_from(&[("ITEMS_PER_PAGE", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "ITEMS_PER_PAGE", .. }));
    }

    #[test]
    fn parses_overrides() {
        let config = config_from(&[
            ("ITEMS_PER_PAGE", "25"),
            ("SECURE_COOKIES", "yes"),
            ("PUBLIC_BASE_URL", "https://todo.example.com/"),
        ])
        .unwrap();
        assert_eq!(config.items_per_page, 25);
        assert!(config.secure_cookies);
        assert_eq!(
            config.share_url("abc"),
            "https://todo.example.com/shared/task/abc"
        );
    }

    #[test]
    fn short_session_secret_is_rejected() {
        let config = Config {
            session_secret: Some(STANDARD.encode([7u8; 16])),
            ..Config::default()
        };
        assert!(matches!(config.session_key(), Err(ConfigError::SessionSecret)));

        let config = Config {
            session_secret: Some(STANDARD.encode([7u8; 64])),
            ..Config::default()
        };
        assert!(config.session_key().is_ok());
    }
}
