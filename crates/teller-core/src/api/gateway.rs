//! The single funnel for backend calls.
//!
//! `RequestGateway` builds headers from the current session, issues the
//! request, and classifies the result into a `RequestOutcome`. A 401 on a
//! request that carried session credentials tears the session down.
//! No retries happen here; retry policy belongs to the caller.

use anyhow::Result;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::error::{error_message, truncate_body, ApiError, ContractError, NETWORK_ERROR_MESSAGE};
use crate::auth::{AuthSnapshot, SessionStore};
use crate::config::Config;

/// Result of one backend call. Exactly one tag per call.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome<T> {
    Success(T),
    HttpError(u16, String),
    NetworkError(String),
    /// The session was rejected and has been torn down
    AuthExpired,
}

impl<T> RequestOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success(_))
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> RequestOutcome<U> {
        match self {
            RequestOutcome::Success(payload) => RequestOutcome::Success(f(payload)),
            RequestOutcome::HttpError(status, message) => RequestOutcome::HttpError(status, message),
            RequestOutcome::NetworkError(message) => RequestOutcome::NetworkError(message),
            RequestOutcome::AuthExpired => RequestOutcome::AuthExpired,
        }
    }

    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            RequestOutcome::Success(payload) => Ok(payload),
            RequestOutcome::HttpError(status, message) => Err(ApiError::Http { status, message }),
            RequestOutcome::NetworkError(message) => Err(ApiError::Network(message)),
            RequestOutcome::AuthExpired => Err(ApiError::AuthExpired),
        }
    }
}

/// Join a base URL and a path with exactly one slash between them.
/// No validation; callers are trusted.
pub fn resolve_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Gateway to the banking backend.
/// Clone is cheap - reqwest::Client and SessionStore are both shared handles.
#[derive(Clone)]
pub struct RequestGateway {
    client: Client,
    base_url: String,
    session: SessionStore,
}

impl RequestGateway {
    pub fn new(config: &Config, session: SessionStore) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            session,
        })
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn url(&self, path: &str) -> String {
        resolve_url(&self.base_url, path)
    }

    /// Issue one call and classify the result.
    ///
    /// `extra_headers` are applied last and may replace the session's
    /// `Authorization`. A 401 while a session is active still ends that
    /// session. Only a response body that doesn't match `T` on a
    /// successful status is an `Err`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        extra_headers: Option<&HeaderMap>,
    ) -> Result<RequestOutcome<T>, ContractError> {
        let url = self.url(path);

        // Read once; a racing teardown after this point is settled by the server
        let snapshot = self.session.authorization();
        let headers = build_headers(snapshot.as_ref(), extra_headers)?;

        let mut request = self.client.request(method.clone(), &url).headers(headers);
        if let Some(body) = body {
            request = request.body(serde_json::to_vec(body).map_err(ContractError::Encode)?);
        }

        debug!(%method, url = %url, authorized = snapshot.is_some(), "Sending request");
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(%method, url = %url, error = %e, "Request did not reach the server");
                return Ok(RequestOutcome::NetworkError(NETWORK_ERROR_MESSAGE.to_string()));
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            if let Some(snapshot) = snapshot {
                warn!(url = %url, generation = snapshot.generation, "Session rejected by server");
                self.session.invalidate(snapshot.generation);
                return Ok(RequestOutcome::AuthExpired);
            }
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if status.is_success() => {
                warn!(url = %url, error = %e, "Failed to read response body");
                return Ok(RequestOutcome::NetworkError(NETWORK_ERROR_MESSAGE.to_string()));
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Failed to read error body");
                String::new()
            }
        };

        if !status.is_success() {
            debug!(status = status.as_u16(), body = %truncate_body(&text), "Request rejected");
            return Ok(RequestOutcome::HttpError(
                status.as_u16(),
                error_message(status.as_u16(), &text),
            ));
        }

        // 204 and friends decode as null
        let payload = if text.trim().is_empty() { "null" } else { text.as_str() };
        match serde_json::from_str(payload) {
            Ok(parsed) => Ok(RequestOutcome::Success(parsed)),
            Err(source) => {
                error!(url = %url, error = %source, body = %truncate_body(&text), "Response did not match expected shape");
                Err(ContractError::Decode { url, source })
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<RequestOutcome<T>, ContractError> {
        self.call(Method::GET, path, None, None).await
    }

    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<RequestOutcome<T>, ContractError> {
        self.call(Method::POST, path, Some(body), None).await
    }

    /// Serialize any body and call
    pub async fn send_json<T: DeserializeOwned, B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<RequestOutcome<T>, ContractError> {
        let body = serde_json::to_value(body).map_err(ContractError::Encode)?;
        self.call(method, path, Some(&body), None).await
    }

    /// `call` flattened into one error type, for `?`-style callers
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<T, ApiError> {
        self.call(method, path, body, None).await?.into_result()
    }
}

fn build_headers(
    snapshot: Option<&AuthSnapshot>,
    extra_headers: Option<&HeaderMap>,
) -> Result<HeaderMap, ContractError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(snapshot) = snapshot {
        headers.insert(header::AUTHORIZATION, snapshot.credential.authorization_value()?);
    }

    if let Some(extra) = extra_headers {
        for name in extra.keys() {
            headers.remove(name);
        }
        for (name, value) in extra {
            headers.append(name.clone(), value.clone());
        }
    }

    Ok(headers)
}

// ============================================================================
// Tests
// ============================================================================
