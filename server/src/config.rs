use anyhow::{Context, Result};

use crate::twitter::Credential;

/// Environment variable holding the fleet's account list: a JSON array of
/// `{"username", "password"}` objects.
pub const CREDENTIALS_ENV: &str = "TWITTER_CREDENTIALS";

/// Runtime configuration. The crawl engine needs nothing beyond the
/// account list.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub credentials: Vec<Credential>,
}

impl AppConfig {
    /// Load configuration from the environment. An unset or empty
    /// credentials variable means an empty fleet, not an error.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CREDENTIALS_ENV).unwrap_or_default();
        let raw = if raw.is_empty() { "[]".to_string() } else { raw };

        let credentials: Vec<Credential> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {CREDENTIALS_ENV}"))?;
        Ok(Self { credentials })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_credential_array() {
        let credentials: Vec<Credential> = serde_json::from_str(
            r#"[{"username": "alice", "password": "pw"}, {"username": "bob"}]"#,
        )
        .unwrap();
        assert_eq!(credentials.len(), 2);
        assert_eq!(credentials[0].username, "alice");
        assert_eq!(credentials[0].password, "pw");
        assert!(credentials[1].password.is_empty());
    }
}
