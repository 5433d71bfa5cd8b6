//! Token refresh against Google's OAuth endpoint

use serde::Deserialize;
use tracing::debug;

use crate::constants::{CLIENT_ID, CLIENT_SECRET};
use crate::error::{Error, Result};

/// Token endpoint response for a refresh grant.
///
/// Google's installed-app flow does not rotate refresh tokens; the field is
/// decoded anyway so an echoed value never breaks parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds (typically 3599).
    pub expires_in: u64,
}

/// Exchange a refresh token for a fresh access token.
///
/// `token_url` is passed in rather than baked to the constant so the pool's
/// tests can stand up a local endpoint; production callers pass
/// [`crate::constants::TOKEN_ENDPOINT`].
pub async fn refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    refresh_token: &str,
) -> Result<TokenResponse> {
    debug!("refreshing access token");
    let params = [
        ("client_id", CLIENT_ID),
        ("client_secret", CLIENT_SECRET),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
    ];

    let response = client
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unreadable body>"));
        return Err(Error::TokenEndpoint {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::CredentialParse(format!("token response: {e}")))
}
