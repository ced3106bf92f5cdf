//! Discovery datagrams and command result messages
//!
//! Both travel as compact JSON. Discovery uses best-effort UDP, so a decode
//! failure is reported to the caller, which drops the datagram.

use serde::{Deserialize, Serialize};

/// Version carried by DISCOVER / ANNOUNCE; mismatches are ignored
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest discovery datagram either side will accept
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Bound on the detail text carried back in a result
pub const MAX_DETAIL_LEN: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram too large ({0} bytes)")]
    TooLarge(usize),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Messages exchanged on the discovery port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscoveryMessage {
    /// Broadcast by the kernel; agents answer to `sender_ip:reply_port`
    Discover { version: u8, reply_port: u16 },
    /// Unicast reply from an agent
    Announce {
        version: u8,
        device_id: String,
        hostname: String,
        /// TCP port of the agent's command listener
        command_port: u16,
    },
}

impl DiscoveryMessage {
    pub fn discover(reply_port: u16) -> Self {
        DiscoveryMessage::Discover {
            version: PROTOCOL_VERSION,
            reply_port,
        }
    }

    pub fn announce(device_id: impl Into<String>, hostname: impl Into<String>, command_port: u16) -> Self {
        DiscoveryMessage::Announce {
            version: PROTOCOL_VERSION,
            device_id: device_id.into(),
            hostname: hostname.into(),
            command_port,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            DiscoveryMessage::Discover { version, .. } => *version,
            DiscoveryMessage::Announce { version, .. } => *version,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(WireError::TooLarge(bytes.len()));
        }
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Why a command did not apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Rejected by the agent's validator, never executed
    InvalidCommand,
    /// Tool ran and exited non-zero
    ExecutionFailed,
    /// Tool could not be started
    SpawnFailed,
    Timeout,
}

/// Agent -> kernel reply for one command, in send order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub detail: String,
}

impl CommandResult {
    pub fn ok(exit_code: i32, detail: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Ok,
            reason: None,
            exit_code: Some(exit_code),
            detail: truncate_detail(detail.into()),
        }
    }

    pub fn error(reason: FailureReason, exit_code: Option<i32>, detail: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::Error,
            reason: Some(reason),
            exit_code,
            detail: truncate_detail(detail.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResultStatus::Ok
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Cut `detail` to `MAX_DETAIL_LEN` bytes on a char boundary
pub fn truncate_detail(mut detail: String) -> String {
    if detail.len() > MAX_DETAIL_LEN {
        let mut cut = MAX_DETAIL_LEN;
        while !detail.is_char_boundary(cut) {
            cut -= 1;
        }
        detail.truncate(cut);
    }
    detail
}
