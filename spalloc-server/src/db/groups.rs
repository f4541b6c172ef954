/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Groups, users and the membership type rule.
//!
//! Internal users (no OpenID subject) may only belong to internal groups;
//! external users only to organisations and collaboratories.  The rule is
//! checked whenever a membership is added or a group's type changes, and a
//! violation is an [`IntegrityError`], never silently corrected.

use std::fmt;

use thiserror::Error;

use super::{GroupId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("integrity violation: {0}")]
pub struct IntegrityError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupType {
    Internal,
    Organisation,
    Collaboratory,
}

impl GroupType {
    pub fn id(self) -> u8 {
        match self {
            GroupType::Internal => 0,
            GroupType::Organisation => 1,
            GroupType::Collaboratory => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Some(match id {
            0 => GroupType::Internal,
            1 => GroupType::Organisation,
            2 => GroupType::Collaboratory,
            _ => return None,
        })
    }

    pub fn is_internal(self) -> bool {
        self == GroupType::Internal
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GroupType::Internal => "INTERNAL",
            GroupType::Organisation => "ORGANISATION",
            GroupType::Collaboratory => "COLLABORATORY",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub group_type: GroupType,
    /// Board-seconds remaining; `None` is unlimited.
    pub quota: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: UserId,
    pub name: String,
    pub openid_subject: Option<String>,
}

impl UserRecord {
    pub fn is_internal(&self) -> bool {
        self.openid_subject.is_none()
    }
}

/// The membership rule for one (user, group) pair.
pub fn check_membership(user: &UserRecord, group: &GroupRecord) -> Result<(), IntegrityError> {
    if user.is_internal() == group.group_type.is_internal() {
        return Ok(());
    }
    let kind = if user.is_internal() { "internal" } else { "external" };
    Err(IntegrityError(format!(
        "{kind} user '{}' cannot be a member of {} group '{}'",
        user.name, group.group_type, group.name
    )))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
