/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Board-second quotas.
//!
//! A group's `quota` is what it has left after every *accounted* job.  Jobs
//! that have not been accounted yet (live jobs, and destroyed jobs awaiting
//! consolidation) are its outstanding usage:
//!
//! ```text
//! available = quota − Σ usage(unaccounted jobs of the group)
//! ```
//!
//! A `None` quota is unlimited and is never charged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::db::{Database, DbError, GroupId, JobId, Tables, UserId};
use crate::jobs::JobState;

use super::AllocationError;

// ── Views ─────────────────────────────────────────────────────────────────────

/// One row of the `jobs_usage` view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobUsage {
    pub job_id: JobId,
    pub group_id: GroupId,
    pub size: u32,
    pub duration_secs: i64,
    pub usage: i64,
}

/// One row of the `quotas` view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserQuota {
    pub user_id: UserId,
    pub group_id: GroupId,
    pub group_name: String,
    pub quota: Option<i64>,
}

// ── Table-level rules ─────────────────────────────────────────────────────────

impl Tables {
    /// Unaccounted board-seconds of `group`, live jobs billed up to `now`.
    pub fn outstanding_usage(&self, group: GroupId, now: DateTime<Utc>) -> i64 {
        self.jobs
            .values()
            .filter(|j| j.group_id == group && !j.accounted_for)
            .map(|j| j.usage(now))
            .sum()
    }

    /// Fast-fail check before searching for boards.
    pub fn check_quota(
        &self,
        group: GroupId,
        projected: i64,
        now: DateTime<Utc>,
    ) -> Result<(), AllocationError> {
        let record = self.groups.get(&group).ok_or(DbError::NoSuchGroup(group))?;
        let Some(quota) = record.quota else {
            return Ok(());
        };
        let available = quota - self.outstanding_usage(group, now);
        if available >= projected {
            Ok(())
        } else {
            Err(AllocationError::QuotaExceeded {
                group,
                projected,
                available,
            })
        }
    }

    pub fn quota_allows_continuing(&self, group: GroupId, now: DateTime<Utc>) -> bool {
        match self.groups.get(&group).and_then(|g| g.quota) {
            Some(quota) => self.outstanding_usage(group, now) <= quota,
            None => true,
        }
    }

    /// Charge a destroyed job's usage to its group.  Returns whether a charge
    /// was made; jobs of unlimited groups are left for later.
    pub fn account_job(&mut self, job: JobId, now: DateTime<Utc>) -> bool {
        let Some(record) = self.jobs.get(&job) else {
            return false;
        };
        if record.accounted_for || record.state != JobState::Destroyed {
            return false;
        }
        let usage = record.usage(now);
        let group = record.group_id;
        let Some(g) = self.groups.get_mut(&group) else {
            return false;
        };
        let Some(quota) = g.quota.as_mut() else {
            return false;
        };
        *quota = (*quota - usage).max(0);
        if let Some(j) = self.jobs.get_mut(&job) {
            j.accounted_for = true;
        }
        debug!(job, group, usage, "job usage accounted");
        true
    }
}

// ── QuotaManager ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QuotaManager {
    db: Arc<Database>,
}

impl QuotaManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn may_create_job(&self, group: GroupId, projected: i64, now: DateTime<Utc>) -> bool {
        self.db
            .read(|t| t.check_quota(group, projected, now))
            .is_ok()
    }

    pub fn may_let_job_continue(&self, group: GroupId, now: DateTime<Utc>) -> bool {
        self.db.read(|t| t.quota_allows_continuing(group, now))
    }

    /// Adjust a group's quota by `delta`, clamping at zero.  Unlimited stays
    /// unlimited.
    pub fn add_quota(&self, group: GroupId, delta: i64) -> Result<Option<i64>, DbError> {
        let updated = self.db.transaction(|t| {
            let g = t.groups.get_mut(&group).ok_or(DbError::NoSuchGroup(group))?;
            if let Some(q) = g.quota.as_mut() {
                *q = (*q + delta).max(0);
            }
            Ok::<_, DbError>(g.quota)
        })?;
        info!(group, delta, quota = ?updated, "quota adjusted");
        Ok(updated)
    }

    /// Charge every destroyed, unaccounted job of a quota-limited group.
    pub fn consolidate(&self, now: DateTime<Utc>) -> usize {
        let count = self
            .db
            .transaction(|t| {
                let pending: Vec<JobId> = t
                    .jobs
                    .values()
                    .filter(|j| j.state == JobState::Destroyed && !j.accounted_for)
                    .map(|j| j.id)
                    .collect();
                let charged = pending
                    .into_iter()
                    .filter(|job| t.account_job(*job, now))
                    .count();
                Ok::<_, DbError>(charged)
            })
            .unwrap_or(0);
        if count > 0 {
            info!(jobs = count, "quota consolidated");
        }
        count
    }

    pub fn jobs_usage(&self, now: DateTime<Utc>) -> Vec<JobUsage> {
        self.db.read(|t| {
            t.jobs
                .values()
                .filter(|j| !j.accounted_for)
                .filter_map(|j| {
                    let size = j.allocation_size?;
                    let start = j.allocation_timestamp?;
                    let end = j.death_timestamp.unwrap_or(now);
                    Some(JobUsage {
                        job_id: j.id,
                        group_id: j.group_id,
                        size,
                        duration_secs: (end - start).num_seconds().max(0),
                        usage: j.usage(now),
                    })
                })
                .collect()
        })
    }

    pub fn user_quotas(&self, user: UserId) -> Vec<UserQuota> {
        self.db.read(|t| {
            t.group_memberships
                .iter()
                .filter(|(u, _)| *u == user)
                .filter_map(|(_, g)| t.groups.get(g))
                .map(|g| UserQuota {
                    user_id: user,
                    group_id: g.id,
                    group_name: g.name.clone(),
                    quota: g.quota,
                })
                .collect()
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::db::JobRecord;
    use crate::test_support::group_with_user;

    fn job(id: JobId, group: GroupId, state: JobState, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id,
            machine_id: 1,
            owner: 1,
            group_id: group,
            state,
            root_id: None,
            width: None,
            height: None,
            depth: None,
            allocation_size: Some(2),
            keepalive_interval: Duration::seconds(60),
            keepalive_timestamp: now,
            keepalive_host: None,
            create_timestamp: now - Duration::seconds(200),
            allocation_timestamp: Some(now - Duration::seconds(100)),
            death_timestamp: (state == JobState::Destroyed).then_some(now),
            death_reason: None,
            accounted_for: false,
            original_request: Vec::new(),
        }
    }

    fn manager(quota: Option<i64>, states: &[JobState]) -> (QuotaManager, Arc<Database>, GroupId, UserId) {
        let now = Utc::now();
        let mut t = Tables::new();
        let (g, u) = group_with_user(&mut t, quota);
        for s in states {
            let id = t.next_job_id();
            t.jobs.insert(id, job(id, g, *s, now));
        }
        let db = Arc::new(Database::new(t));
        (QuotaManager::new(Arc::clone(&db)), db, g, u)
    }

    // ── Admission ─────────────────────────────────────────────────────────────

    #[test]
    fn unlimited_groups_always_pass() {
        let (qm, _, g, _) = manager(None, &[JobState::Ready]);
        assert!(qm.may_create_job(g, i64::MAX, Utc::now()));
        assert!(qm.may_let_job_continue(g, Utc::now()));
    }

    #[test]
    fn outstanding_usage_reduces_headroom() {
        // One live 2-board job running for 100 s: 200 outstanding.
        let (qm, _, g, _) = manager(Some(500), &[JobState::Ready]);
        let now = Utc::now();
        assert!(qm.may_create_job(g, 300, now));
        assert!(!qm.may_create_job(g, 301, now));
        assert!(qm.may_let_job_continue(g, now));
    }

    #[test]
    fn overdrawn_group_may_not_continue() {
        let (qm, _, g, _) = manager(Some(100), &[JobState::Ready]);
        assert!(!qm.may_let_job_continue(g, Utc::now()));
    }

    // ── Consolidation ─────────────────────────────────────────────────────────

    #[test]
    fn consolidation_charges_destroyed_jobs_once() {
        let (qm, db, g, _) = manager(Some(1000), &[JobState::Destroyed, JobState::Ready]);
        let now = Utc::now();
        assert_eq!(qm.consolidate(now), 1);
        assert_eq!(db.read(|t| t.groups[&g].quota), Some(800));
        assert!(db.read(|t| t.jobs[&1].accounted_for));
        assert!(!db.read(|t| t.jobs[&2].accounted_for));

        assert_eq!(qm.consolidate(now), 0);
        assert_eq!(db.read(|t| t.groups[&g].quota), Some(800));
    }

    #[test]
    fn consolidation_saturates_at_zero() {
        let (qm, db, g, _) = manager(Some(50), &[JobState::Destroyed]);
        qm.consolidate(Utc::now());
        assert_eq!(db.read(|t| t.groups[&g].quota), Some(0));
    }

    #[test]
    fn add_quota_clamps() {
        let (qm, _, g, _) = manager(Some(10), &[]);
        assert_eq!(qm.add_quota(g, 5).unwrap(), Some(15));
        assert_eq!(qm.add_quota(g, -100).unwrap(), Some(0));
        assert!(matches!(qm.add_quota(99, 1), Err(DbError::NoSuchGroup(99))));
    }

    // ── Views ─────────────────────────────────────────────────────────────────

    #[test]
    fn views_list_unaccounted_jobs_and_member_groups() {
        let (qm, _, g, u) = manager(Some(10), &[JobState::Destroyed]);
        let usage = qm.jobs_usage(Utc::now());
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].size, 2);
        assert_eq!(usage[0].usage, 200);

        let quotas = qm.user_quotas(u);
        assert_eq!(quotas.len(), 1);
        assert_eq!(quotas[0].group_id, g);
        assert_eq!(quotas[0].quota, Some(10));
    }
}
