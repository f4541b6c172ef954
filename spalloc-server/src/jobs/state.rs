/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Job lifecycle states.
//!
//! ```text
//! QUEUED ──► ALLOCATED ──► POWER_PENDING ──► READY
//!   │            │              │              │
//!   └────────────┴──────────────┴──────────────┴──► DESTROYED
//! ```
//!
//! Numeric ids are the ones stored in the `jobs` table; `ALLOCATED` is a
//! transient state between reservation and the first power command.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum JobState {
    Queued,
    PowerPending,
    Ready,
    Destroyed,
    Allocated,
}

impl JobState {
    pub fn id(self) -> u8 {
        match self {
            JobState::Queued => 1,
            JobState::PowerPending => 2,
            JobState::Ready => 3,
            JobState::Destroyed => 4,
            JobState::Allocated => 5,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            1 => JobState::Queued,
            2 => JobState::PowerPending,
            3 => JobState::Ready,
            4 => JobState::Destroyed,
            5 => JobState::Allocated,
            _ => return None,
        })
    }

    /// `true` for every state that still holds (or waits for) resources.
    pub fn is_live(self) -> bool {
        self != JobState::Destroyed
    }

    /// `true` for states that own boards.
    pub fn holds_boards(self) -> bool {
        matches!(
            self,
            JobState::Allocated | JobState::PowerPending | JobState::Ready
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Allocated)
                | (Allocated, PowerPending)
                | (PowerPending, Ready)
                | (Queued | Allocated | PowerPending | Ready, Destroyed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JobState::Queued => "QUEUED",
            JobState::PowerPending => "POWER",
            JobState::Ready => "READY",
            JobState::Destroyed => "DESTROYED",
            JobState::Allocated => "ALLOCATED",
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobState; 5] = [
        JobState::Queued,
        JobState::Allocated,
        JobState::PowerPending,
        JobState::Ready,
        JobState::Destroyed,
    ];

    #[test]
    fn ids_round_trip() {
        for s in ALL {
            assert_eq!(JobState::from_id(s.id()), Some(s));
        }
        assert_eq!(JobState::from_id(0), None);
        assert_eq!(JobState::Destroyed.id(), 4);
    }

    #[test]
    fn forward_edges_are_allowed() {
        assert!(JobState::Queued.can_transition_to(JobState::Allocated));
        assert!(JobState::Allocated.can_transition_to(JobState::PowerPending));
        assert!(JobState::PowerPending.can_transition_to(JobState::Ready));
    }

    #[test]
    fn every_live_state_may_be_destroyed() {
        for s in ALL {
            assert_eq!(s.can_transition_to(JobState::Destroyed), s.is_live());
        }
    }

    #[test]
    fn no_shortcuts_or_resurrection() {
        assert!(!JobState::Queued.can_transition_to(JobState::Ready));
        assert!(!JobState::Queued.can_transition_to(JobState::PowerPending));
        assert!(!JobState::Ready.can_transition_to(JobState::PowerPending));
        for s in ALL {
            assert!(!JobState::Destroyed.can_transition_to(s));
        }
    }
}
