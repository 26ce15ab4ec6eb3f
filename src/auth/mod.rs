//! Boundary to the external authorization collaborator.
//!
//! The relay never validates tokens itself; it hands them to the auth
//! service before admitting a connection to the registry. A refused (or
//! unreachable) collaborator is terminal for that connection attempt — the
//! socket is closed with a distinguishing code and never retried here.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::RelayError;

/// External authorization collaborator.
#[async_trait]
pub trait Authorize: Send + Sync {
    /// Validate a bearer token. Returns the user id it belongs to, or
    /// `None` if the token is invalid or expired.
    async fn authenticate(&self, token: &str) -> Result<Option<String>, RelayError>;

    /// Whether a user may join a duel room.
    async fn authorize_room(&self, user_id: &str, duel_id: &str) -> Result<bool, RelayError>;
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    authorized: bool,
}

/// HTTP client for the auth microservice.
pub struct HttpAuthorizer {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAuthorizer {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }
}

#[async_trait]
impl Authorize for HttpAuthorizer {
    async fn authenticate(&self, token: &str) -> Result<Option<String>, RelayError> {
        let resp: ValidateResponse = self
            .http
            .post(format!("{}/validate", self.base_url))
            .json(&json!({ "token": token }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(if resp.valid { resp.user_id } else { None })
    }

    async fn authorize_room(&self, user_id: &str, duel_id: &str) -> Result<bool, RelayError> {
        let resp: AuthorizeResponse = self
            .http
            .post(format!("{}/authorize", self.base_url))
            .json(&json!({ "userId": user_id, "duelId": duel_id }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp.authorized)
    }
}
