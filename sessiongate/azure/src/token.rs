use self::cache::TokenCache;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use sessiongate_core::{Error, Result};
use std::{fmt, time::Duration};
use tokio::process::Command;

/// An Entra ID bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

/// Obtains tokens for an Entra ID scope.
#[async_trait::async_trait]
pub trait TokenSource: Send + Sync + 'static {
    async fn token(&self, scope: &str) -> Result<AccessToken>;
}

/// Obtains tokens from the Azure CLI's logged-in account.
///
/// Tokens are cached per scope until shortly before they expire.
#[derive(Debug, Default)]
pub struct AzureCliCredential {
    cache: TokenCache,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliToken {
    access_token: String,
    #[serde(default)]
    expires_on: Option<String>,
    /// Newer CLI releases add a POSIX timestamp under this snake-case name.
    #[serde(default, rename = "expires_on")]
    expires_on_epoch: Option<i64>,
}

pub(crate) mod cache {
    use super::AccessToken;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use std::{collections::HashMap, time::Duration};

    #[derive(Debug, Default)]
    pub(crate) struct TokenCache(Mutex<HashMap<String, AccessToken>>);

    impl TokenCache {
        pub(crate) fn get(&self, scope: &str, now: DateTime<Utc>, margin: Duration) -> Option<AccessToken> {
            let margin = chrono::Duration::from_std(margin).ok()?;
            self.0
                .lock()
                .get(scope)
                .filter(|t| t.expires_on - margin > now)
                .cloned()
        }

        pub(crate) fn put(&self, scope: &str, token: AccessToken) {
            self.0.lock().insert(scope.to_string(), token);
        }
    }
}

// === impl AccessToken ===

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_on", &self.expires_on)
            .finish_non_exhaustive()
    }
}

// === impl AzureCliCredential ===

impl AzureCliCredential {
    const REFRESH_MARGIN: Duration = Duration::from_secs(5 * 60);

    async fn fetch(scope: &str) -> Result<AccessToken> {
        let output = Command::new("az")
            .args(["account", "get-access-token", "--output", "json", "--scope", scope])
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|error| Error::fatal("running the Azure CLI", error))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::fatal(
                format!("az account get-access-token failed ({})", output.status),
                stderr.trim().to_string(),
            ));
        }
        parse_cli_token(&output.stdout)
    }
}

#[async_trait::async_trait]
impl TokenSource for AzureCliCredential {
    async fn token(&self, scope: &str) -> Result<AccessToken> {
        if let Some(token) = self.cache.get(scope, Utc::now(), Self::REFRESH_MARGIN) {
            return Ok(token);
        }
        let token = Self::fetch(scope).await?;
        tracing::debug!(scope, expires_on = %token.expires_on, "Obtained access token");
        self.cache.put(scope, token.clone());
        Ok(token)
    }
}

fn parse_cli_token(stdout: &[u8]) -> Result<AccessToken> {
    let CliToken {
        access_token,
        expires_on,
        expires_on_epoch,
    } = serde_json::from_slice(stdout)
        .map_err(|error| Error::fatal("parsing Azure CLI token", error))?;

    let expires_on = match (expires_on_epoch, expires_on) {
        (Some(epoch), _) => DateTime::from_timestamp(epoch, 0),
        // Older releases only report local time without an offset.
        (None, Some(local)) => NaiveDateTime::parse_from_str(&local, "%Y-%m-%d %H:%M:%S%.f")
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|t| t.with_timezone(&Utc)),
        (None, None) => None,
    }
    .ok_or_else(|| Error::invalid("token expiry", "Azure CLI returned no usable expiry"))?;

    Ok(AccessToken {
        token: access_token,
        expires_on,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn prefers_epoch_expiry() {
        let token = parse_cli_token(
            br#"{
                "accessToken": "eyJ0",
                "expiresOn": "2025-01-01 00:00:00.000000",
                "expires_on": 1735693200,
                "tokenType": "Bearer"
            }"#,
        )
        .unwrap();
        assert_eq!(token.token, "eyJ0");
        assert_eq!(token.expires_on, DateTime::from_timestamp(1735693200, 0).unwrap());
    }

    #[test]
    fn falls_back_to_local_expiry() {
        let token =
            parse_cli_token(br#"{"accessToken": "t", "expiresOn": "2025-01-01 10:30:00.123456"}"#)
                .unwrap();
        let local = Local
            .from_local_datetime(
                &NaiveDateTime::parse_from_str("2025-01-01 10:30:00.123456", "%Y-%m-%d %H:%M:%S%.f")
                    .unwrap(),
            )
            .earliest()
            .unwrap();
        assert_eq!(token.expires_on, local.with_timezone(&Utc));
    }

    #[test]
    fn requires_an_expiry() {
        assert!(parse_cli_token(br#"{"accessToken": "t"}"#).is_err());
        assert!(parse_cli_token(b"not json").is_err());
    }

    #[test]
    fn cache_honours_refresh_margin() {
        let cache = cache::TokenCache::default();
        let now = Utc::now();
        let margin = Duration::from_secs(300);
        cache.put(
            "scope",
            AccessToken {
                token: "t".to_string(),
                expires_on: now + chrono::Duration::seconds(600),
            },
        );
        assert!(cache.get("scope", now, margin).is_some());
        assert!(cache
            .get("scope", now + chrono::Duration::seconds(301), margin)
            .is_none());
        assert!(cache.get("other", now, margin).is_none());
    }
}
