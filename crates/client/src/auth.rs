//! Bearer tokens and their refresh.
//!
//! Saved tokens live in ~/.config/sasjs/auth.json (0600 on Unix).
//! Access tokens are JWTs; one that expires within the hour is refreshed
//! through `/SASLogon/oauth/token` before use.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;
use crate::request::{Call, RequestClient};
use crate::transport::{Method, RequestBody};

pub const TOKEN_PATH: &str = "/SASLogon/oauth/token";

/// Access tokens expiring within this many seconds are refreshed.
const ACCESS_TOKEN_TTL_SECS: i64 = 3600;
/// Refresh tokens this close to expiry are treated as expired.
const REFRESH_TOKEN_TTL_SECS: i64 = 30;

/// OAuth client plus its current tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    pub client: String,
    pub secret: String,
    #[serde(alias = "accessToken")]
    pub access_token: String,
    #[serde(alias = "refreshToken")]
    pub refresh_token: String,
}

/// How a call authenticates.
#[derive(Debug, Clone, Default)]
pub enum Credentials {
    /// Cookie session (the server already knows the caller)
    #[default]
    None,
    Bearer(String),
    /// Refreshed in place when the access token nears expiry
    Refreshable(Arc<Mutex<AuthConfig>>),
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Credentials::Bearer(token.into())
    }

    pub fn refreshable(config: AuthConfig) -> Self {
        Credentials::Refreshable(Arc::new(Mutex::new(config)))
    }

    /// Current auth config, if refreshable.
    pub fn auth_config(&self) -> Option<AuthConfig> {
        match self {
            Credentials::Refreshable(config) => Some(config.lock().clone()),
            _ => None,
        }
    }

    /// Token to send right now, refreshing first when needed.
    pub fn access_token(&self, client: &RequestClient) -> Result<Option<String>, Error> {
        match self {
            Credentials::None => Ok(None),
            Credentials::Bearer(token) => Ok(Some(token.clone())),
            Credentials::Refreshable(config) => {
                let mut config = config.lock();
                if is_token_expiring(&config.access_token, ACCESS_TOKEN_TTL_SECS) {
                    if is_token_expiring(&config.refresh_token, REFRESH_TOKEN_TTL_SECS) {
                        return Err(Error::LoginRequired);
                    }
                    let refreshed = refresh_tokens(client, &config)?;
                    *config = refreshed;
                }
                Ok(Some(config.access_token.clone()))
            }
        }
    }
}

/// Seconds-since-epoch `exp` claim of a JWT.
pub fn token_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

/// True when the token expires within `ttl_secs`, or cannot be read.
pub fn is_token_expiring(token: &str, ttl_secs: i64) -> bool {
    match token_expiry(token) {
        Some(exp) => exp - chrono::Utc::now().timestamp() <= ttl_secs,
        None => true,
    }
}

/// Exchange the refresh token for a new token pair.
pub fn refresh_tokens(client: &RequestClient, config: &AuthConfig) -> Result<AuthConfig, Error> {
    log::info!("refreshing access token for client '{}'", config.client);
    let basic = STANDARD.encode(format!("{}:{}", config.client, config.secret));
    let form = vec![
        ("grant_type".to_string(), "refresh_token".to_string()),
        ("refresh_token".to_string(), config.refresh_token.clone()),
    ];

    let response = client.send(
        Call::new(Method::Post, TOKEN_PATH)
            .body(RequestBody::Form(form))
            .header("Authorization", format!("Basic {basic}")),
    )?;

    let access_token = response.result["access_token"]
        .as_str()
        .ok_or(Error::LoginRequired)?
        .to_string();
    let refresh_token = response.result["refresh_token"]
        .as_str()
        .unwrap_or(&config.refresh_token)
        .to_string();

    Ok(AuthConfig {
        access_token,
        refresh_token,
        ..config.clone()
    })
}

// ── Saved tokens ────────────────────────────────────────────────────

/// Returns the path to the saved tokens file.
pub fn auth_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|c| c.join("sasjs").join("auth.json"))
}

/// Load saved tokens. None if absent or unreadable.
pub fn load_auth_from(path: &Path) -> Option<AuthConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

/// Save tokens, creating the parent directory. 0600 on Unix.
pub fn save_auth_to(path: &Path, config: &AuthConfig) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn jwt_expiring_in(secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("{header}.{payload}.sig")
}
