//! Credentials for the SD-WAN controller and the UPS cards.
//!
//! Read from the environment once at startup and handed to the clients that
//! need them. Passwords never appear in `Debug` output.

use std::fmt;

use crate::error::MonitorError;

pub const ENV_SDWAN_URL: &str = "SDWAN_URL";
pub const ENV_SDWAN_USER: &str = "SDWAN_USER";
pub const ENV_SDWAN_PASS: &str = "SDWAN_PASS";
pub const ENV_UPS_USER: &str = "UPS_USER";
pub const ENV_UPS_PASS: &str = "UPS_PASS";

/// vManage login
#[derive(Clone)]
pub struct SdwanCredentials {
    /// Base URL, e.g. `https://vmanage.example.net:8443`
    pub url: String,
    pub username: String,
    pub password: String,
}

/// UPS web card login, shared by every configured UPS
#[derive(Clone)]
pub struct UpsCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub sdwan: SdwanCredentials,
    pub ups: UpsCredentials,
}

impl Credentials {
    /// Read credentials from the process environment
    pub fn from_env() -> Result<Self, MonitorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read credentials through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MonitorError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &str| -> Result<String, MonitorError> {
            match lookup(key) {
                Some(value) if !value.trim().is_empty() => Ok(value),
                _ => Err(MonitorError::config(format!(
                    "environment variable {} is not set",
                    key
                ))),
            }
        };

        let url = require(ENV_SDWAN_URL)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(MonitorError::config(format!(
                "{} must start with http:// or https:// (got {})",
                ENV_SDWAN_URL, url
            )));
        }

        Ok(Self {
            sdwan: SdwanCredentials {
                url: url.trim_end_matches('/').to_string(),
                username: require(ENV_SDWAN_USER)?,
                password: require(ENV_SDWAN_PASS)?,
            },
            ups: UpsCredentials {
                username: require(ENV_UPS_USER)?,
                password: require(ENV_UPS_PASS)?,
            },
        })
    }
}

impl fmt::Debug for SdwanCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SdwanCredentials")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl fmt::Debug for UpsCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpsCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn full_env() -> HashMap<String, String> {
        env(&[
            (ENV_SDWAN_URL, "https://vmanage.lab:8443/"),
            (ENV_SDWAN_USER, "admin"),
            (ENV_SDWAN_PASS, "s3cret"),
            (ENV_UPS_USER, "ups-admin"),
            (ENV_UPS_PASS, "ups-s3cret"),
        ])
    }

    #[test]
    fn test_complete_environment() {
        let vars = full_env();
        let creds = Credentials::from_lookup(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(creds.sdwan.url, "https://vmanage.lab:8443");
        assert_eq!(creds.sdwan.username, "admin");
        assert_eq!(creds.ups.username, "ups-admin");
    }

    #[test]
    fn test_missing_variable() {
        let mut vars = full_env();
        vars.remove(ENV_UPS_PASS);
        let err = Credentials::from_lookup(|k| vars.get(k).cloned()).unwrap_err();
        assert!(err.to_string().contains(ENV_UPS_PASS));
    }

    #[test]
    fn test_url_scheme_required() {
        let mut vars = full_env();
        vars.insert(ENV_SDWAN_URL.to_string(), "vmanage.lab".to_string());
        assert!(Credentials::from_lookup(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let vars = full_env();
        let creds = Credentials::from_lookup(|k| vars.get(k).cloned()).unwrap();
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
