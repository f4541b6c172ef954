/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Failure taxonomy for board communications.
//!
//! | Variant | Retryable | Meaning |
//! |---|---|---|
//! | `Timeout` | yes | no (valid) reply within the deadline |
//! | `MalformedResponse` | no | reply could not be parsed |
//! | `DeviceRejected` | no | BMP answered with a non-OK result code |
//! | `CommsFailure` | no | retry budget exhausted; wraps the last failure |
//! | `UnknownBmp` | no | no address configured for the BMP |
//! | `Io` | no | socket-level failure |
//!
//! Packet-level retries never leave the transceiver; callers only see
//! `CommsFailure` once the budget is spent.

use thiserror::Error;

use crate::scp::{ResultCode, ScpCommand};
use crate::transceiver::BmpCoords;

#[derive(Debug, Error)]
pub enum CommsError {
    #[error("timed out waiting for reply to {operation}")]
    Timeout { operation: &'static str },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("BMP rejected {command:?} with {code}")]
    DeviceRejected {
        command: ScpCommand,
        code: ResultCode,
    },

    #[error("{operation} failed after {attempts} attempt(s): {last}")]
    CommsFailure {
        operation: String,
        attempts: u32,
        #[source]
        last: Box<CommsError>,
    },

    #[error("no BMP configured at {0}")]
    UnknownBmp(BmpCoords),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommsError {
    /// `true` for failures that another attempt may cure.
    pub fn is_retryable(&self) -> bool {
        match self {
            CommsError::Timeout { .. } => true,
            CommsError::DeviceRejected { code, .. } => code.is_transient(),
            _ => false,
        }
    }

    /// Wrap `self` as the final failure of an exhausted retry loop.
    pub fn exhausted(self, operation: impl Into<String>, attempts: u32) -> Self {
        CommsError::CommsFailure {
            operation: operation.into(),
            attempts,
            last: Box::new(self),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
