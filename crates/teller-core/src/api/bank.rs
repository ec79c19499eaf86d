//! Login/logout flows and the banking endpoints, on top of the gateway.
//!
//! Payload shapes belong to the backend; everything except the credential
//! exchange is passed through as `serde_json::Value`.

use anyhow::Result;
use reqwest::header::{self, HeaderMap};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::{ApiError, ContractError, RequestGateway, RequestOutcome};
use crate::auth::{CredentialMaterial, SessionStore, UserProfile};
use crate::config::{AuthProtocol, Config};

const AUTH_PATH: &str = "/auth";
const USERS_PATH: &str = "/users";
const ME_PATH: &str = "/users/me";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken", alias = "access_token")]
    token: String,
    #[serde(default)]
    user: Option<Value>,
}

/// Client for the banking backend.
/// Clone is cheap - it shares the gateway's connection pool and session.
#[derive(Clone)]
pub struct BankClient {
    gateway: RequestGateway,
    protocol: AuthProtocol,
}

impl BankClient {
    pub fn new(gateway: RequestGateway, protocol: AuthProtocol) -> Self {
        Self { gateway, protocol }
    }

    /// File-backed session in the configured namespace. Call
    /// `session().restore()` to pick up a session from a previous run.
    pub fn from_config(config: &Config) -> Result<Self> {
        let session = SessionStore::from_config(config)?;
        let gateway = RequestGateway::new(config, session)?;
        Ok(Self::new(gateway, config.auth_protocol))
    }

    pub fn gateway(&self) -> &RequestGateway {
        &self.gateway
    }

    pub fn session(&self) -> &SessionStore {
        self.gateway.session()
    }

    pub fn protocol(&self) -> AuthProtocol {
        self.protocol
    }

    // ===== Session lifecycle =====

    /// Exchange credentials and start a session. Any existing session is
    /// ended first. Returns the cached profile, if one could be loaded.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserProfile>, ApiError> {
        self.session().destroy();

        let profile = match self.protocol {
            AuthProtocol::Token => self.login_with_token(username, password).await?,
            AuthProtocol::Basic => self.login_with_basic(username, password).await?,
        };

        info!(protocol = ?self.protocol, has_profile = profile.is_some(), "Login successful");
        Ok(profile)
    }

    pub fn logout(&self) {
        self.session().destroy();
        info!("Logged out");
    }

    async fn login_with_token(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserProfile>, ApiError> {
        let body = json!({ "username": username, "password": password });
        let response: TokenResponse = self
            .gateway
            .request(Method::POST, AUTH_PATH, Some(&body))
            .await?;

        let credential = CredentialMaterial::OpaqueToken(response.token);
        let profile = match response.user.as_ref().and_then(UserProfile::from_json) {
            Some(profile) => Some(profile),
            None => self.fetch_profile_with(&credential).await,
        };

        self.session().create(credential, profile.clone());
        Ok(profile)
    }

    /// Basic auth has no exchange; the credentials are verified by fetching
    /// the caller's own user record.
    async fn login_with_basic(
        &self,
        username: &str,
        password: &str,
    ) -> Result<Option<UserProfile>, ApiError> {
        let credential = CredentialMaterial::basic(username, password);
        let headers = authorization_override(&credential)?;

        let me: Value = self
            .gateway
            .call(Method::GET, ME_PATH, None, Some(&headers))
            .await?
            .into_result()?;

        let profile = UserProfile::from_json(&me);
        if profile.is_none() {
            warn!("User record has no usable id, continuing without profile");
        }

        self.session().create(credential, profile.clone());
        Ok(profile)
    }

    /// Best effort: a missing profile never blocks login.
    async fn fetch_profile_with(&self, credential: &CredentialMaterial) -> Option<UserProfile> {
        let headers = match authorization_override(credential) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(error = %e, "Cannot build profile request");
                return None;
            }
        };

        match self
            .gateway
            .call::<Value>(Method::GET, ME_PATH, None, Some(&headers))
            .await
        {
            Ok(RequestOutcome::Success(me)) => UserProfile::from_json(&me),
            Ok(outcome) => {
                warn!(?outcome, "Could not load user profile");
                None
            }
            Err(e) => {
                warn!(error = %e, "Could not load user profile");
                None
            }
        }
    }

    // ===== Users =====

    pub async fn list_users(&self) -> Result<Value, ApiError> {
        self.gateway.request(Method::GET, USERS_PATH, None).await
    }

    pub async fn create_user(&self, user: &Value) -> Result<Value, ApiError> {
        self.gateway.request(Method::POST, USERS_PATH, Some(user)).await
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Value, ApiError> {
        let path = format!("{}/{}", USERS_PATH, user_id);
        self.gateway.request(Method::GET, &path, None).await
    }

    pub async fn me(&self) -> Result<Value, ApiError> {
        self.gateway.request(Method::GET, ME_PATH, None).await
    }

    // ===== Accounts =====

    pub async fn list_accounts(&self, user_id: &str) -> Result<Value, ApiError> {
        let path = format!("{}/{}/accounts", USERS_PATH, user_id);
        self.gateway.request(Method::GET, &path, None).await
    }

    pub async fn create_account(&self, user_id: &str, account: &Value) -> Result<Value, ApiError> {
        let path = format!("{}/{}/accounts", USERS_PATH, user_id);
        self.gateway.request(Method::POST, &path, Some(account)).await
    }
}

fn authorization_override(credential: &CredentialMaterial) -> Result<HeaderMap, ContractError> {
    let mut headers = HeaderMap::new();
    headers.insert(header::AUTHORIZATION, credential.authorization_value()?);
    Ok(headers)
}

// ============================================================================
// Tests
// ============================================================================
