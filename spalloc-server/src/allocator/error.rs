/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Error types for the allocation engine.
//!
//! * [`RejectReason`] explains why one candidate block was discarded; it is
//!   only ever logged.
//! * [`AllocationError`] is what [`AllocationEngine::allocate`] returns.
//!
//! | Variant | Kind | Job outcome |
//! |---|---|---|
//! | `InvalidShape` | validation | rejected at creation |
//! | `NoSuitableRegion` | resource | stays queued |
//! | `QuotaExceeded` | resource | stays queued |
//! | `AllocationConflict` | resource | stays queued |
//! | `NotQueued` | state | nothing to do |
//!
//! [`AllocationEngine::allocate`]: super::AllocationEngine::allocate

use thiserror::Error;

use crate::db::{DbError, GroupId, JobId};
use crate::jobs::JobState;
use crate::topology::TriadCoords;

// ── Candidate rejection ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// More missing, dead, owned or fully blacklisted positions than the
    /// request tolerates.
    TooManyUnusable { unusable: u32, tolerance: u32 },

    /// Too few boards reachable from the root over live links.
    Disconnected { reachable: u32, required: u32 },

    /// A dead link between two members of a block that tolerates nothing.
    DeadInternalLink { at: TriadCoords },

    /// The root board itself cannot be used.
    RootUnusable,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooManyUnusable { unusable, tolerance } => write!(
                f,
                "{} unusable board(s) exceeds tolerance of {}",
                unusable, tolerance
            ),
            RejectReason::Disconnected {
                reachable,
                required,
            } => write!(
                f,
                "only {} board(s) reachable from root, need {}",
                reachable, required
            ),
            RejectReason::DeadInternalLink { at } => {
                write!(f, "dead link inside block at {}", at)
            }
            RejectReason::RootUnusable => write!(f, "root board is unusable"),
        }
    }
}

// ── Engine errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("no suitable region for job {job}")]
    NoSuitableRegion { job: JobId },

    #[error("group {group} quota exceeded: {projected} board-seconds requested, {available} left")]
    QuotaExceeded {
        group: GroupId,
        projected: i64,
        available: i64,
    },

    #[error("boards for job {job} were taken concurrently")]
    AllocationConflict { job: JobId },

    #[error("job {job} is {state}, not QUEUED")]
    NotQueued { job: JobId, state: JobState },

    #[error(transparent)]
    Db(#[from] DbError),
}

impl AllocationError {
    /// Resource failures leave the job queued for a later round.
    pub fn is_resource_failure(&self) -> bool {
        matches!(
            self,
            AllocationError::NoSuitableRegion { .. }
                | AllocationError::QuotaExceeded { .. }
                | AllocationError::AllocationConflict { .. }
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
