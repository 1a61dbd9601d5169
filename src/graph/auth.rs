//! OAuth2 token state.
//!
//! The interactive code-grant flow happens outside this crate; we load
//! the resulting tokens from disk and keep them fresh with the refresh
//! grant. Tokens are persisted at mode 0600 next to the cache database.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::client::classify_transport;

const AUTH_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
const AUTH_REDIRECT_URL: &str = "https://login.live.com/oauth20_desktop.srf";
const AUTH_CLIENT_ID: &str = "9bc4b9ed-6a92-4b2c-a7a3-1fd81c04f7a5";

/// A set of OAuth2 tokens for the Graph API.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub account: String,
    /// Lifetime in seconds as reported by the token endpoint; only used
    /// to compute `expires_at` when the endpoint omits it.
    #[serde(default)]
    pub expires_in: i64,
    /// Unix timestamp after which the access token is stale.
    #[serde(default)]
    pub expires_at: i64,
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(skip)]
    path: PathBuf,
}

impl Auth {
    /// Load tokens previously saved by the authentication flow.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read(path)?;
        let mut auth: Auth = serde_json::from_slice(&contents)?;
        auth.path = path.to_path_buf();
        Ok(auth)
    }

    /// Persist tokens to the file they were loaded from, mode 0600.
    pub fn to_file(&self) -> Result<()> {
        let data = serde_json::to_vec(self)?;
        std::fs::write(&self.path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// Whether the access token has passed its expiration time.
    pub fn expired(&self) -> bool {
        self.expires_at <= chrono::Utc::now().timestamp()
    }

    /// Force the next `refresh` to actually hit the token endpoint.
    pub fn invalidate(&mut self) {
        self.expires_at = 0;
    }

    /// Refresh the access token if it has expired.
    ///
    /// A transport failure while offline is swallowed: the old token
    /// stays in place and the next user-facing operation reports the
    /// network state instead. Any other failure to obtain tokens is
    /// `AuthExpired`.
    pub async fn refresh(&mut self, http: &reqwest::Client) -> Result<()> {
        if !self.expired() {
            return Ok(());
        }
        log::info!("Auth tokens expired, attempting renewal.");

        let form = [
            ("client_id", AUTH_CLIENT_ID),
            ("redirect_uri", AUTH_REDIRECT_URL),
            ("refresh_token", self.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        let response = match http.post(AUTH_TOKEN_URL).form(&form).send().await {
            Ok(resp) => resp,
            Err(err) => {
                if classify_transport(&err).is_offline() {
                    log::trace!("Network unreachable during token renewal, ignoring.");
                    return Ok(());
                }
                log::error!("Could not POST to renew tokens: {}", err);
                return Err(Error::AuthExpired);
            }
        };

        let body = response.bytes().await.map_err(|_| Error::AuthExpired)?;
        let renewed: Auth = serde_json::from_slice(&body).map_err(|_| Error::AuthExpired)?;
        if renewed.access_token.is_empty() || renewed.refresh_token.is_empty() {
            log::error!("Failed to renew access tokens, reauthentication required.");
            return Err(Error::AuthExpired);
        }

        self.access_token = renewed.access_token;
        self.refresh_token = renewed.refresh_token;
        self.expires_in = renewed.expires_in;
        self.expires_at = if renewed.expires_at > 0 {
            renewed.expires_at
        } else {
            chrono::Utc::now().timestamp() + renewed.expires_in
        };

        if !self.path.as_os_str().is_empty() {
            if let Err(err) = self.to_file() {
                log::warn!("Could not persist renewed auth tokens: {}", err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Auth {
        Auth {
            account: "user@example.com".to_string(),
            expires_in: 3600,
            expires_at: chrono::Utc::now().timestamp() + 3600,
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            path: PathBuf::new(),
        }
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_tokens.json");

        let mut auth = sample();
        auth.path = path.clone();
        auth.to_file().unwrap();

        let loaded = Auth::from_file(&path).unwrap();
        assert_eq!(loaded.account, auth.account);
        assert_eq!(loaded.access_token, auth.access_token);
        assert_eq!(loaded.refresh_token, auth.refresh_token);
        assert_eq!(loaded.expires_at, auth.expires_at);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_tokens.json");
        let mut auth = sample();
        auth.path = path.clone();
        auth.to_file().unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_expired_checks_wall_clock() {
        let mut auth = sample();
        assert!(!auth.expired());
        auth.expires_at = chrono::Utc::now().timestamp() - 1;
        assert!(auth.expired());
    }

    #[test]
    fn test_invalidate_forces_expiry() {
        let mut auth = sample();
        auth.invalidate();
        assert!(auth.expired());
    }

    #[tokio::test]
    async fn test_refresh_is_a_noop_while_tokens_are_fresh() {
        let mut auth = sample();
        let before = auth.access_token.clone();
        // No network involved: the early-out triggers before any request.
        auth.refresh(&reqwest::Client::new()).await.unwrap();
        assert_eq!(auth.access_token, before);
    }
}
