use std::fmt;

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use keyring::Entry;
use reqwest::header::HeaderValue;

use crate::api::ContractError;

/// Whatever must be attached to a request to prove identity.
///
/// Exactly one variant is active per session, and the variant decides how
/// the `Authorization` header is built:
/// - `OpaqueToken`: `Authorization: Bearer <token>`
/// - `UsernamePassword`: `Authorization: Basic <base64(username:password)>`
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialMaterial {
    OpaqueToken(String),
    UsernamePassword(String, String),
}

impl CredentialMaterial {
    pub fn token(token: impl Into<String>) -> Self {
        Self::OpaqueToken(token.into())
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UsernamePassword(username.into(), password.into())
    }

    /// The raw header text, e.g. `Bearer abc`
    pub fn header_text(&self) -> String {
        match self {
            Self::OpaqueToken(token) => format!("Bearer {}", token),
            Self::UsernamePassword(username, password) => {
                // RFC 7617
                let encoded =
                    general_purpose::STANDARD.encode(format!("{}:{}", username, password));
                format!("Basic {}", encoded)
            }
        }
    }

    /// Build the `Authorization` header value, marked sensitive
    pub fn authorization_value(&self) -> Result<HeaderValue, ContractError> {
        let mut value = HeaderValue::from_str(&self.header_text()).map_err(|_| {
            ContractError::InvalidHeader(
                "credential contains characters not allowed in a header".to_string(),
            )
        })?;
        value.set_sensitive(true);
        Ok(value)
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::OpaqueToken(_) => "bearer",
            Self::UsernamePassword(..) => "basic",
        }
    }
}

impl fmt::Debug for CredentialMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpaqueToken(_) => f.write_str("OpaqueToken(<redacted>)"),
            Self::UsernamePassword(username, _) => {
                write!(f, "UsernamePassword({:?}, <redacted>)", username)
            }
        }
    }
}

/// Basic-auth passwords in the OS keychain, so they never land on disk.
pub struct CredentialStore {
    service: String,
}

impl CredentialStore {
    pub fn new(namespace: &str) -> Self {
        Self {
            service: format!("teller:{}", namespace),
        }
    }

    /// Store username and password in the OS keychain
    pub fn store(&self, username: &str, password: &str) -> Result<()> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve password for a username from the OS keychain
    pub fn get_password(&self, username: &str) -> Result<String> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;
        entry
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Delete stored credentials for a username
    pub fn delete(&self, username: &str) -> Result<()> {
        let entry = Entry::new(&self.service, username)
            .context("Failed to create keyring entry")?;
        entry
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }
}
