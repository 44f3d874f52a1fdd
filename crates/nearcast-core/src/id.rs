//! Identity types for Nearcast
//!
//! A peer is named the way nearby-device transports name them: a human
//! readable display name plus a transport-assigned handle. Two discoveries of
//! the same device may carry different handles, so identity is only stable
//! within one discovery epoch.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{NearcastError, NearcastResult};

/// Remote (or local) node identity
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    display_name: Arc<str>,
    handle: u64,
}

impl PeerId {
    #[inline]
    pub fn new(display_name: impl Into<Arc<str>>, handle: u64) -> Self {
        PeerId {
            display_name: display_name.into(),
            handle,
        }
    }

    /// Local identity with a random handle
    pub fn generate(display_name: impl Into<Arc<str>>) -> Self {
        PeerId::new(display_name, rand::random())
    }

    #[inline]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[inline]
    pub fn handle(&self) -> u64 {
        self.handle
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Peer({}#{:08x})", self.display_name, self.handle)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:08x}", self.display_name, self.handle)
    }
}

/// Transport session handle - proof that a link to a peer is up
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    #[inline]
    pub fn new(id: u64) -> Self {
        SessionHandle(id)
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({:016x})", self.0)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of one invite attempt, unique per node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AttemptId(pub u64);

impl fmt::Debug for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Attempt({})", self.0)
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one fan-out pass, unique per node
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PassId(pub u64);

impl fmt::Debug for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pass({})", self.0)
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Service type a node advertises and browses for.
///
/// Lowercase ASCII letters, digits and hyphens, 1-63 characters,
/// no leading or trailing hyphen.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceId(String);

impl ServiceId {
    pub const MAX_LEN: usize = 63;
    pub const DEFAULT: &'static str = "nearcast-tracker";

    pub fn new(id: impl Into<String>) -> NearcastResult<Self> {
        let id = id.into();
        let valid_chars = id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');

        if id.is_empty()
            || id.len() > Self::MAX_LEN
            || !valid_chars
            || id.starts_with('-')
            || id.ends_with('-')
        {
            return Err(NearcastError::InvalidServiceId(id));
        }
        Ok(ServiceId(id))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ServiceId {
    fn default() -> Self {
        ServiceId(Self::DEFAULT.to_string())
    }
}

impl TryFrom<String> for ServiceId {
    type Error = NearcastError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ServiceId::new(value)
    }
}

impl From<ServiceId> for String {
    fn from(value: ServiceId) -> Self {
        value.0
    }
}

impl fmt::Debug for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Service({})", self.0)
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
