//! Authentication module for managing the login session.
//!
//! This module provides:
//! - `CredentialMaterial`: bearer token or basic-auth pair, and the header it produces
//! - `SessionStore`: the single owner of session state, with timer-driven expiry
//! - `SessionPersistence`: in-memory or file-backed storage of the session
//! - `CredentialStore`: OS keychain storage for basic-auth passwords

pub mod credentials;
pub mod persistence;
pub mod session;
pub mod store;

pub use credentials::{CredentialMaterial, CredentialStore};
pub use persistence::{FilePersistence, MemoryPersistence, SessionPersistence};
pub use session::{Session, UserProfile};
pub use store::{AuthSnapshot, EndReason, GuardDecision, SessionEvent, SessionStore};
