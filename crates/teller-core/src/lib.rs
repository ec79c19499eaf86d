//! Core library for teller - a client for a banking backend.
//!
//! The interesting part of the client is the session and request-mediation
//! layer:
//!
//! - `auth::SessionStore` owns the login session, persists it, expires it on
//!   a timer and guards protected views.
//! - `api::RequestGateway` attaches the session's credentials to every call
//!   and classifies the result into success, HTTP, network or auth-expired.
//! - `api::BankClient` runs the login flows and wraps the backend endpoints.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiError, BankClient, ContractError, RequestGateway, RequestOutcome};
pub use auth::{
    CredentialMaterial, EndReason, GuardDecision, SessionEvent, SessionStore, UserProfile,
};
pub use config::{AuthProtocol, Config};
