//! Authenticator collaborator and Conclave access descriptor.
//!
//! Fetching tokens and host lists is someone else's job (an HTTP client,
//! a fixture, a cache). The session layers only see the trait and the
//! resolved socket host.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::Transience;

/// Host entry type that carries the raw socket protocol.
pub const SOCKET_HOST_TYPE: &str = "socket";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
    #[error("access descriptor has no usable {SOCKET_HOST_TYPE} host")]
    NoSocketHost,
}

impl AuthError {
    /// Whether retrying authentication may succeed.
    pub fn transience(&self) -> Transience {
        match self {
            // Token refresh and host rotation both happen server-side, so a
            // later attempt can observe different material.
            AuthError::Failed(_) | AuthError::NoSocketHost => Transience::Retryable,
        }
    }
}

/// Asynchronous single-result credential source.
///
/// Called from the reconnect supervisor thread, which is the only waiter;
/// implementations may block.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, account_id: &str) -> Result<ConclaveAccess, AuthError>;
}

/// One advertised Conclave endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConclaveHost {
    #[serde(rename = "type")]
    pub host_type: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub compressed: bool,
}

/// Access material returned by the authenticator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConclaveAccess {
    #[serde(rename = "channelId")]
    pub channel_id: String,
    pub hosts: Vec<ConclaveHost>,
    pub token: String,
}

/// Everything the wire layer needs to dial one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedHost {
    pub host: String,
    pub port: u16,
    pub encrypted: bool,
    pub compressed: bool,
    pub channel_id: String,
    pub access_token: String,
}

/// Pick the first `socket` host from an access descriptor.
pub fn resolve_socket_host(access: &ConclaveAccess) -> Result<ResolvedHost, AuthError> {
    let host = access
        .hosts
        .iter()
        .find(|h| h.host_type == SOCKET_HOST_TYPE)
        .ok_or(AuthError::NoSocketHost)?;

    Ok(ResolvedHost {
        host: host.host.clone(),
        port: host.port,
        encrypted: host.encrypted,
        compressed: host.compressed,
        channel_id: access.channel_id.clone(),
        access_token: access.token.clone(),
    })
}
