//! In-band status codes for the KivIO wire protocol
//!
//! Database nodes answer most requests with HTTP 200 and carry the real
//! outcome in a small JSON status body. These codes are part of the wire
//! contract and are matched by every tier.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Successful response
pub const OK: u32 = 1000;
/// Malformed or missing request parameters
pub const PARAMS_ERROR: u32 = 1001;
/// Key/value not found
pub const KEY_NOT_FOUND: u32 = 1002;
/// Key already present; writes never overwrite
pub const KEY_DUPLICATE: u32 = 1003;
/// Internal server error
pub const INTERNAL_ERROR: u32 = 1004;
/// The addressed node is not the raft leader
pub const NOT_LEADER: u32 = 1005;

/// Wire status body
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u32,
    #[serde(default)]
    pub message: String,
    /// HTTP address of the current leader, set on NOT_LEADER responses
    /// when the follower can resolve it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: OK,
            message: String::new(),
            leader: None,
        }
    }

    pub fn params_error() -> Self {
        Self {
            code: PARAMS_ERROR,
            message: "params error".to_string(),
            leader: None,
        }
    }

    pub fn key_not_found() -> Self {
        Self {
            code: KEY_NOT_FOUND,
            message: "key not found".to_string(),
            leader: None,
        }
    }

    pub fn key_duplicate() -> Self {
        Self {
            code: KEY_DUPLICATE,
            message: "key duplicate".to_string(),
            leader: None,
        }
    }

    pub fn internal_error() -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: "internal error".to_string(),
            leader: None,
        }
    }

    pub fn not_leader(leader: Option<String>) -> Self {
        Self {
            code: NOT_LEADER,
            message: "i am not the leader".to_string(),
            leader,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.code == OK
    }

    /// Convert a non-OK status into the matching error.
    ///
    /// Returns `Ok(())` for [`OK`].
    pub fn into_result(self) -> Result<(), Error> {
        match self.code {
            OK => Ok(()),
            PARAMS_ERROR => Err(Error::InvalidParams(self.message)),
            KEY_NOT_FOUND => Err(Error::KeyNotFound),
            KEY_DUPLICATE => Err(Error::KeyDuplicate(self.message)),
            NOT_LEADER => Err(Error::NotLeader(self.leader)),
            _ => Err(Error::Internal(self.message)),
        }
    }
}

impl From<&Error> for Status {
    fn from(err: &Error) -> Self {
        match err {
            Error::KeyNotFound => Status::key_not_found(),
            Error::KeyDuplicate(_) => Status::key_duplicate(),
            Error::NotLeader(leader) => Status::not_leader(leader.clone()),
            Error::InvalidParams(_) => Status::params_error(),
            _ => Status::internal_error(),
        }
    }
}
