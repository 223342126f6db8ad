#![forbid(unsafe_code)]

//! Async client for the external session/identity service.
//!
//! The proxy never validates or mints credentials itself: it turns identity
//! tokens into authorization grants and grants into access tokens by calling
//! out to this service, with a bounded timeout per call.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionServiceError {
	#[error("session service request failed: {0}")]
	Http(#[from] reqwest::Error),

	#[error("session service rejected the request: status={status} {message}")]
	Rejected {
		status: u16,
		message: String,
	},

	#[error("session service returned an unusable response: {0}")]
	InvalidResponse(String),
}

/// Grant issued for a connecting client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthGrantResponse {
	pub authorization_grant: String,
	pub server_identity_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest<'a> {
	uuid: Uuid,
	username: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	identity_token: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
	authorization_grant: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
	server_access_token: String,
}

pub struct SessionServiceClient {
	http: reqwest::Client,
	base_url: String,
}

impl SessionServiceClient {
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<SessionServiceClient, SessionServiceError> {
		let http = reqwest::Client::builder().timeout(timeout).build()?;
		let mut base_url = base_url.into();
		while base_url.ends_with('/') {
			base_url.pop();
		}
		Ok(SessionServiceClient { http, base_url })
	}

	/// Request an authorization grant for a connecting client.
	pub async fn request_auth_grant(
		&self,
		uuid: Uuid,
		username: &str,
		identity_token: Option<&str>,
	) -> Result<AuthGrantResponse, SessionServiceError> {
		let url = format!("{}/session/grant", self.base_url);
		debug!(%uuid, username, "requesting authorization grant");

		let response = self
			.http
			.post(&url)
			.json(&GrantRequest {
				uuid,
				username,
				identity_token: identity_token.filter(|t| !t.is_empty()),
			})
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(SessionServiceError::Rejected {
				status: status.as_u16(),
				message,
			});
		}

		let grant: AuthGrantResponse = response.json().await?;
		if grant.authorization_grant.is_empty() {
			return Err(SessionServiceError::InvalidResponse("empty authorization grant".to_string()));
		}
		Ok(grant)
	}

	/// Exchange a server authorization grant for a server access token.
	pub async fn exchange_server_grant(&self, authorization_grant: &str) -> Result<String, SessionServiceError> {
		let url = format!("{}/session/exchange", self.base_url);
		debug!("exchanging server authorization grant");

		let response = self
			.http
			.post(&url)
			.json(&ExchangeRequest { authorization_grant })
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			let message = response.text().await.unwrap_or_default();
			return Err(SessionServiceError::Rejected {
				status: status.as_u16(),
				message,
			});
		}

		let exchanged: ExchangeResponse = response.json().await?;
		if exchanged.server_access_token.is_empty() {
			return Err(SessionServiceError::InvalidResponse("empty server access token".to_string()));
		}
		Ok(exchanged.server_access_token)
	}
}
