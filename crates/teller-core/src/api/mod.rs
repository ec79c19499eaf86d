//! REST client module for the banking backend.
//!
//! This module provides the `RequestGateway`, the single funnel every call
//! goes through, and the `BankClient` login flows and endpoint helpers
//! built on top of it.
//!
//! The backend accepts either a bearer token issued by `POST /auth` or
//! HTTP Basic credentials; see `config::AuthProtocol`.

pub mod bank;
pub mod error;
pub mod gateway;

pub use bank::BankClient;
pub use error::{ApiError, ContractError, NETWORK_ERROR_MESSAGE};
pub use gateway::{resolve_url, RequestGateway, RequestOutcome};
