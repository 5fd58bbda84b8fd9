//! Authentication Layer for Tessera
//!
//! Every channel authenticates once, during its handshake, before it is
//! offered to its pool. The server answers STARTUP with AUTHENTICATE when it
//! requires credentials; the channel then drives an [`Authenticator`] through
//! AUTH_RESPONSE / AUTH_CHALLENGE rounds until AUTH_SUCCESS or an error.
//!
//! # Security Model
//!
//! - Credentials are never printed: `Debug` and `Display` redact the password
//! - Server-side token checks (used by the test mock node) compare in constant time
//!
//! # Example
//!
//! ```
//! use tessera_common::auth::AuthConfig;
//!
//! let auth = AuthConfig::with_credentials("cassandra", "secret");
//! assert!(auth.requires_auth());
//! assert_eq!(auth.to_string(), "PlainText(cassandra, *****)");
//!
//! let no_auth = AuthConfig::disabled();
//! assert!(no_auth.authenticator().is_none());
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, TesseraError};

/// Drives the SASL-style exchange of one channel handshake.
pub trait Authenticator: Send + Sync + 'static {
    /// Token sent in the first AUTH_RESPONSE. `authenticator_class` is the
    /// server-side authenticator named in the AUTHENTICATE frame.
    fn initial_response(&self, authenticator_class: &str) -> Result<Bytes>;

    /// Answers an AUTH_CHALLENGE.
    fn evaluate_challenge(&self, challenge: &[u8]) -> Result<Bytes>;

    /// Called with the final AUTH_SUCCESS token.
    fn on_success(&self, _token: &[u8]) {}
}

/// Username/password pair.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `\0username\0password`, the PLAIN mechanism token.
    pub fn plain_token(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.username.len() + self.password.len());
        buf.put_u8(0);
        buf.extend_from_slice(self.username.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(self.password.as_bytes());
        buf.freeze()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"*****")
            .finish()
    }
}

/// Sends the PLAIN token and accepts no further challenges.
#[derive(Clone)]
pub struct PlainTextAuthenticator {
    credentials: Credentials,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Credentials::new(username, password),
        }
    }
}

impl fmt::Debug for PlainTextAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainTextAuthenticator")
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Authenticator for PlainTextAuthenticator {
    fn initial_response(&self, _authenticator_class: &str) -> Result<Bytes> {
        Ok(self.credentials.plain_token())
    }

    fn evaluate_challenge(&self, _challenge: &[u8]) -> Result<Bytes> {
        Err(TesseraError::Authentication(
            "Plain text authentication does not accept challenges".to_string(),
        ))
    }
}

/// Authentication configuration.
///
/// On the client this selects the authenticator handed to every channel; on
/// the server side of tests it validates incoming tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthConfig {
    credentials: Option<Credentials>,
}

impl AuthConfig {
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            credentials: Some(Credentials::new(username, password)),
        }
    }

    pub fn disabled() -> Self {
        Self { credentials: None }
    }

    pub fn requires_auth(&self) -> bool {
        self.credentials.is_some()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// The client-side authenticator, if credentials are configured.
    pub fn authenticator(&self) -> Option<Arc<dyn Authenticator>> {
        self.credentials.as_ref().map(|c| {
            Arc::new(PlainTextAuthenticator {
                credentials: c.clone(),
            }) as Arc<dyn Authenticator>
        })
    }

    /// Checks a PLAIN token against the configured credentials.
    ///
    /// Always `true` when authentication is disabled.
    pub fn validate_token(&self, token: &[u8]) -> bool {
        match &self.credentials {
            Some(expected) => constant_time_eq(&expected.plain_token(), token),
            None => true,
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.credentials {
            Some(c) => write!(f, "PlainText({}, *****)", c.username),
            None => write!(f, "Disabled"),
        }
    }
}

/// Compares every byte regardless of where the first difference is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.iter().zip(b.iter()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}
