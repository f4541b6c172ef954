/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Job lifecycle.
//!
//! [`JobManager`] owns every job state transition.  Each transition runs in
//! one store transaction, so a job never has two transitions in flight and
//! a failure part-way leaves nothing behind.
//!
//! Power is never switched here: transitions that need it append rows to
//! `pending_changes`, which the BMP controller drains and reports back
//! through [`JobManager::power_completed`].

pub mod state;

pub use state::JobState;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use spalloc_comms::{Direction, PowerCommand};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::allocator::{
    AllocationEngine, AllocationError, AllocationRequest, AllocationShape, BoardLocator,
};
use crate::db::{
    BoardId, Database, DbError, GroupId, IntegrityError, JobId, JobRecord, JobRequestRecord,
    MachineId, Tables, UserId,
};

// ── Policy ────────────────────────────────────────────────────────────────────

/// Rate at which a queued request accrues importance, by how it was asked.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PriorityScale {
    /// Per board, for board-count requests.
    pub size: f64,
    /// Per triad of area, for rectangle requests.
    pub dimensions: f64,
    /// Flat, for requests naming a board.
    pub specific_board: f64,
}

impl Default for PriorityScale {
    fn default() -> Self {
        Self {
            size: 1.0,
            dimensions: 1.5,
            specific_board: 65.0,
        }
    }
}

impl PriorityScale {
    pub fn priority(&self, shape: &AllocationShape) -> i64 {
        let p = match shape {
            AllocationShape::NumBoards(n) => f64::from(*n) * self.size,
            AllocationShape::SingleBoard(None) => self.size,
            AllocationShape::Rectangle { width, height, .. } => {
                f64::from(width * height) * self.dimensions
            }
            AllocationShape::RootedRectangle { .. }
            | AllocationShape::SingleBoard(Some(_))
            | AllocationShape::Boards(_) => self.specific_board,
        };
        p as i64
    }
}

#[derive(Debug, Clone)]
pub struct JobPolicy {
    /// Requests more than this far below the most important one wait.
    pub importance_span: i64,
    /// How long a request may stay unsatisfiable before it is given up.
    pub allocation_retry_window: Duration,
    pub default_keepalive: Duration,
    pub min_keepalive: Duration,
    pub max_keepalive: Duration,
    pub priority_scale: PriorityScale,
}

impl Default for JobPolicy {
    fn default() -> Self {
        Self {
            importance_span: 10_000,
            allocation_retry_window: Duration::hours(1),
            default_keepalive: Duration::seconds(60),
            min_keepalive: Duration::seconds(30),
            max_keepalive: Duration::seconds(300),
            priority_scale: PriorityScale::default(),
        }
    }
}

// ── Requests and results ──────────────────────────────────────────────────────

/// A request to create a job.
#[derive(Debug, Clone)]
pub struct CreateJob {
    /// Target machine; `None` picks the first in-service machine carrying
    /// every one of `tags`.
    pub machine: Option<String>,
    pub tags: BTreeSet<String>,
    pub owner: UserId,
    pub group: GroupId,
    pub request: AllocationRequest,
    pub keepalive_interval: Option<Duration>,
    pub original_request: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerOutcome {
    Succeeded { to_state: JobState },
    Failed { reason: String, boards: Vec<BoardId> },
}

/// What one allocator round did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationRound {
    pub allocated: Vec<JobId>,
    pub still_queued: Vec<JobId>,
    /// Outside the importance span this round.
    pub deferred: Vec<JobId>,
    pub destroyed: Vec<JobId>,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    Validation(String),

    #[error("no such job: {0}")]
    NotFound(JobId),

    #[error("job {job} is destroyed: {reason}")]
    Destroyed { job: JobId, reason: String },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Db(#[from] DbError),
}

pub const REASON_KEEPALIVE: &str = "keepalive expired";
pub const REASON_QUOTA: &str = "quota exceeded";
pub const REASON_NO_REGION: &str = "unable to allocate: no suitable region";
pub const REASON_EMERGENCY: &str = "emergency stop";

// ── Transitions on the tables ─────────────────────────────────────────────────

fn select_machine(t: &Tables, req: &CreateJob) -> Result<MachineId, JobError> {
    let machine = match &req.machine {
        Some(name) => t
            .machine_by_name(name)
            .ok_or_else(|| JobError::Validation(format!("no machine called '{name}'")))?,
        None => t
            .machines
            .values()
            .find(|m| m.in_service && req.tags.is_subset(&m.tags))
            .ok_or_else(|| JobError::Validation(format!("no machine tagged {:?}", req.tags)))?,
    };
    if !machine.in_service {
        return Err(JobError::Validation(format!(
            "machine '{}' is out of service",
            machine.name
        )));
    }
    Ok(machine.id)
}

fn named_boards(shape: &AllocationShape) -> Vec<&BoardLocator> {
    match shape {
        AllocationShape::Boards(list) => list.iter().collect(),
        AllocationShape::SingleBoard(Some(loc)) => vec![loc],
        _ => Vec::new(),
    }
}

/// Destroy `job` inside a transaction.  Returns `false` if there was nothing
/// to destroy.
fn destroy_in(t: &mut Tables, job: JobId, reason: &str, now: DateTime<Utc>) -> Result<bool, JobError> {
    let Some(record) = t.jobs.get(&job) else {
        return Ok(false);
    };
    if record.state == JobState::Destroyed {
        return Ok(false);
    }

    // Power-ons not yet started are dropped; ones already running finish
    // and are followed by the power-off queued below.
    let mut in_flight = BTreeSet::new();
    t.pending_changes.retain(|_, c| {
        if c.job_id != Some(job) || c.power != PowerCommand::On {
            return true;
        }
        if c.in_progress {
            in_flight.insert(c.board_id);
        }
        c.in_progress
    });

    let released = AllocationEngine::release(t, job);
    for board in released {
        let powered = t.board(board)?.powered;
        let off_queued = t
            .changes_for_job(job)
            .any(|c| c.board_id == board && c.power == PowerCommand::Off && !c.in_progress);
        if (powered || in_flight.contains(&board)) && !off_queued {
            t.queue_change(
                Some(job),
                board,
                PowerCommand::Off,
                JobState::Destroyed,
                JobState::Destroyed,
                Vec::new(),
            );
        }
    }

    if let Some(record) = t.jobs.get_mut(&job) {
        record.state = JobState::Destroyed;
        record.death_reason = Some(reason.to_string());
        record.death_timestamp = Some(now);
    }
    t.job_requests.retain(|_, r| r.job_id != job);
    t.account_job(job, now);
    Ok(true)
}

/// Move a freshly allocated job to `POWER_PENDING`, queueing power-on for
/// each of its boards.
fn issue_power_on(
    t: &mut Tables,
    job: JobId,
    links: BTreeMap<BoardId, Vec<Direction>>,
) -> Result<(), JobError> {
    let state = t.jobs.get(&job).map(|j| j.state).ok_or(JobError::NotFound(job))?;
    if state != JobState::Allocated {
        return Ok(());
    }
    for (board, stop_links) in links {
        t.queue_change(
            Some(job),
            board,
            PowerCommand::On,
            JobState::Allocated,
            JobState::Ready,
            stop_links,
        );
    }
    if let Some(record) = t.jobs.get_mut(&job) {
        record.state = JobState::PowerPending;
    }
    Ok(())
}

// ── JobManager ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct JobManager {
    db: Arc<Database>,
    engine: AllocationEngine,
    policy: JobPolicy,
}

impl JobManager {
    pub fn new(db: Arc<Database>, policy: JobPolicy) -> Self {
        Self {
            engine: AllocationEngine::new(Arc::clone(&db)),
            db,
            policy,
        }
    }

    pub fn policy(&self) -> &JobPolicy {
        &self.policy
    }

    pub fn job(&self, job: JobId) -> Option<JobRecord> {
        self.db.read(|t| t.jobs.get(&job).cloned())
    }

    /// Validate and queue a new job.
    pub fn create_job(&self, req: CreateJob, now: DateTime<Utc>) -> Result<JobId, JobError> {
        let keepalive = req
            .keepalive_interval
            .unwrap_or(self.policy.default_keepalive)
            .clamp(self.policy.min_keepalive, self.policy.max_keepalive);
        let priority = self.policy.priority_scale.priority(&req.request.shape);

        let (id, machine_id) = self.db.transaction(|t| {
            let machine_id = select_machine(t, &req)?;
            let geometry = *t.machines[&machine_id].geometry();
            req.request
                .shape
                .validate(&geometry)
                .map_err(|e| JobError::Validation(e.to_string()))?;
            for loc in named_boards(&req.request.shape) {
                if t.resolve_locator(machine_id, loc).is_none() {
                    return Err(JobError::Validation(format!("no board at {loc}")));
                }
            }
            if !t.users.contains_key(&req.owner) || !t.groups.contains_key(&req.group) {
                return Err(JobError::Validation(format!(
                    "unknown user {} or group {}",
                    req.owner, req.group
                )));
            }
            if !t.is_member(req.owner, req.group) {
                return Err(JobError::Validation(format!(
                    "user {} is not a member of group {}",
                    req.owner, req.group
                )));
            }

            let projected =
                i64::from(req.request.shape.max_boards(&geometry)) * keepalive.num_seconds();
            t.check_quota(req.group, projected, now)?;

            let id = t.next_job_id();
            t.jobs.insert(
                id,
                JobRecord {
                    id,
                    machine_id,
                    owner: req.owner,
                    group_id: req.group,
                    state: JobState::Queued,
                    root_id: None,
                    width: None,
                    height: None,
                    depth: None,
                    allocation_size: None,
                    keepalive_interval: keepalive,
                    keepalive_timestamp: now,
                    keepalive_host: None,
                    create_timestamp: now,
                    allocation_timestamp: None,
                    death_timestamp: None,
                    death_reason: None,
                    accounted_for: false,
                    original_request: req.original_request.clone(),
                },
            );
            let req_id = t.next_request_id();
            t.job_requests.insert(
                req_id,
                JobRequestRecord {
                    id: req_id,
                    job_id: id,
                    request: req.request.clone(),
                    importance: 0,
                    priority,
                },
            );
            Ok::<_, JobError>((id, machine_id))
        })?;
        info!(job = id, machine = machine_id, owner = req.owner, group = req.group, "job created");
        Ok(id)
    }

    /// One allocator round over the queue.
    pub fn allocate_queued(&self, now: DateTime<Utc>) -> AllocationRound {
        let mut round = AllocationRound::default();
        let mut tasks: Vec<(i64, u64, JobId, DateTime<Utc>, GroupId, i64)> = self.db.read(|t| {
            t.job_requests
                .values()
                .filter_map(|r| {
                    let job = t.jobs.get(&r.job_id)?;
                    let geometry = t.machines.get(&job.machine_id)?.geometry();
                    let projected = i64::from(r.request.shape.max_boards(geometry))
                        * job.keepalive_interval.num_seconds();
                    Some((r.importance, r.id, r.job_id, job.create_timestamp, job.group_id, projected))
                })
                .collect()
        });
        tasks.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let Some(max_importance) = tasks.first().map(|t| t.0) else {
            return round;
        };

        for (importance, _, job, created, group, projected) in tasks {
            if importance < max_importance - self.policy.importance_span {
                round.deferred.push(job);
                continue;
            }
            if let Err(e) = self.db.read(|t| t.check_quota(group, projected, now)) {
                debug!(job, error = %e, "allocation deferred by quota");
                round.still_queued.push(job);
                continue;
            }

            match self.engine.allocate(job, now) {
                Ok(allocation) => {
                    let geometry = self
                        .db
                        .read(|t| t.machines.get(&allocation.machine_id).map(|m| *m.geometry()));
                    let links = geometry
                        .map(|g| allocation.perimeter_links(&g))
                        .unwrap_or_default();
                    match self.db.transaction(|t| issue_power_on(t, job, links)) {
                        Ok(()) => round.allocated.push(job),
                        Err(e) => warn!(job, error = %e, "failed to queue power-on"),
                    }
                }
                Err(AllocationError::NotQueued { .. }) => {}
                Err(e) if e.is_resource_failure() => {
                    if now - created > self.policy.allocation_retry_window {
                        if let Ok(true) = self.destroy_job(job, REASON_NO_REGION, now) {
                            round.destroyed.push(job);
                        }
                    } else {
                        round.still_queued.push(job);
                    }
                }
                Err(e) => {
                    warn!(job, error = %e, "allocation failed");
                    let reason = format!("unable to allocate: {e}");
                    if let Ok(true) = self.destroy_job(job, &reason, now) {
                        round.destroyed.push(job);
                    }
                }
            }
        }

        // Everything still waiting grows more important.
        let bumped = self.db.transaction(|t| {
            for r in t.job_requests.values_mut() {
                r.importance += r.priority;
            }
            Ok::<_, DbError>(t.job_requests.len())
        });
        debug!(
            allocated = round.allocated.len(),
            waiting = bumped.unwrap_or(0),
            "allocation round complete"
        );
        round
    }

    pub fn keepalive(&self, job: JobId, host: Option<&str>, now: DateTime<Utc>) -> Result<(), JobError> {
        self.db.transaction(|t| {
            let record = t.jobs.get_mut(&job).ok_or(JobError::NotFound(job))?;
            if record.state == JobState::Destroyed {
                return Err(JobError::Destroyed {
                    job,
                    reason: record.death_reason.clone().unwrap_or_default(),
                });
            }
            record.keepalive_timestamp = now;
            record.keepalive_host = host.map(str::to_string);
            Ok(())
        })
    }

    /// Destroy a job; `Ok(false)` if it is unknown or already gone.
    pub fn destroy_job(&self, job: JobId, reason: &str, now: DateTime<Utc>) -> Result<bool, JobError> {
        let destroyed = self.db.transaction(|t| destroy_in(t, job, reason, now))?;
        if destroyed {
            info!(job, reason, "job destroyed");
        }
        Ok(destroyed)
    }

    /// Keepalive sweep, then quota sweep.
    pub fn expire_jobs(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut destroyed = Vec::new();

        let lapsed: Vec<JobId> = self.db.read(|t| {
            t.jobs
                .values()
                .filter(|j| j.state.is_live() && j.keepalive_timestamp + j.keepalive_interval < now)
                .map(|j| j.id)
                .collect()
        });
        for job in lapsed {
            match self.destroy_job(job, REASON_KEEPALIVE, now) {
                Ok(true) => destroyed.push(job),
                Ok(false) => {}
                Err(e) => warn!(job, error = %e, "keepalive expiry failed"),
            }
        }

        let overdrawn: Vec<JobId> = self.db.read(|t| {
            t.jobs
                .values()
                .filter(|j| j.state.is_live() && !t.quota_allows_continuing(j.group_id, now))
                .map(|j| j.id)
                .collect()
        });
        for job in overdrawn {
            match self.destroy_job(job, REASON_QUOTA, now) {
                Ok(true) => destroyed.push(job),
                Ok(false) => {}
                Err(e) => warn!(job, error = %e, "quota expiry failed"),
            }
        }
        destroyed
    }

    /// Report the end of a job's power changes.
    pub fn power_completed(
        &self,
        job: JobId,
        outcome: PowerOutcome,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.db.transaction(|t| {
            let state = t.jobs.get(&job).map(|j| j.state).ok_or(JobError::NotFound(job))?;
            if state == JobState::Destroyed {
                debug!(job, "power change finished for destroyed job");
                return Ok(());
            }
            match &outcome {
                PowerOutcome::Succeeded { to_state } => {
                    if state.can_transition_to(*to_state) {
                        if let Some(record) = t.jobs.get_mut(&job) {
                            record.state = *to_state;
                        }
                        info!(job, state = %to_state, "job powered");
                    }
                }
                PowerOutcome::Failed { reason, boards } => {
                    for b in boards {
                        t.board_mut(*b)?.needs_check = true;
                    }
                    let reason = format!("power on failed: {reason}");
                    destroy_in(t, job, &reason, now)?;
                    warn!(job, %reason, ?boards, "job destroyed");
                }
            }
            Ok(())
        })
    }

    /// Destroy every live job and power off every powered board.
    pub fn emergency_stop(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, JobError> {
        let destroyed = self.db.transaction(|t| {
            let live: Vec<JobId> = t
                .jobs
                .values()
                .filter(|j| j.state.is_live())
                .map(|j| j.id)
                .collect();
            for job in &live {
                destroy_in(t, *job, REASON_EMERGENCY, now)?;
            }
            t.pending_changes
                .retain(|_, c| c.in_progress || c.power == PowerCommand::Off);
            let covered: BTreeSet<BoardId> = t
                .pending_changes
                .values()
                .filter(|c| c.power == PowerCommand::Off)
                .map(|c| c.board_id)
                .collect();
            let powered: Vec<BoardId> = t
                .boards
                .values()
                .filter(|b| b.powered && !covered.contains(&b.id))
                .map(|b| b.id)
                .collect();
            for board in powered {
                t.queue_change(
                    None,
                    board,
                    PowerCommand::Off,
                    JobState::Destroyed,
                    JobState::Destroyed,
                    Vec::new(),
                );
            }
            Ok::<_, JobError>(live)
        })?;
        warn!(jobs = destroyed.len(), "emergency stop");
        Ok(destroyed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GroupType, PendingChange};
    use crate::test_support::{group_with_user, machine};
    use crate::topology::TriadCoords;

    struct Fixture {
        db: Arc<Database>,
        jobs: JobManager,
        group: GroupId,
        user: UserId,
    }

    fn fixture(width: u32, height: u32, quota: Option<i64>) -> Fixture {
        let (mut tables, _) = machine(width, height, false);
        let (group, user) = group_with_user(&mut tables, quota);
        let db = Arc::new(Database::new(tables));
        Fixture {
            jobs: JobManager::new(Arc::clone(&db), JobPolicy::default()),
            db,
            group,
            user,
        }
    }

    impl Fixture {
        fn request(&self, shape: AllocationShape) -> CreateJob {
            CreateJob {
                machine: Some("m".into()),
                tags: BTreeSet::new(),
                owner: self.user,
                group: self.group,
                request: AllocationRequest {
                    shape,
                    max_dead_boards: 0,
                },
                keepalive_interval: None,
                original_request: b"{}".to_vec(),
            }
        }

        fn create(&self, shape: AllocationShape, now: DateTime<Utc>) -> JobId {
            self.jobs.create_job(self.request(shape), now).unwrap()
        }

        fn state(&self, job: JobId) -> JobState {
            self.jobs.job(job).unwrap().state
        }

        fn changes(&self, job: JobId) -> Vec<PendingChange> {
            self.db.read(|t| t.changes_for_job(job).cloned().collect())
        }

        fn set_powered(&self, job: JobId) {
            self.db
                .transaction(|t| {
                    for b in t.boards_owned_by(job) {
                        t.board_mut(b)?.powered = true;
                    }
                    Ok::<_, DbError>(())
                })
                .unwrap();
        }

        /// Pretend the BMP controller finished every change of `job`.
        fn complete_power(&self, job: JobId, now: DateTime<Utc>) {
            self.set_powered(job);
            self.db
                .transaction(|t| {
                    t.pending_changes.retain(|_, c| c.job_id != Some(job));
                    Ok::<_, DbError>(())
                })
                .unwrap();
            self.jobs
                .power_completed(
                    job,
                    PowerOutcome::Succeeded {
                        to_state: JobState::Ready,
                    },
                    now,
                )
                .unwrap();
        }
    }

    fn single() -> AllocationShape {
        AllocationShape::SingleBoard(None)
    }

    fn triad() -> AllocationShape {
        AllocationShape::Rectangle {
            width: 1,
            height: 1,
            depth: None,
        }
    }

    // ── Creation ──────────────────────────────────────────────────────────────

    #[test]
    fn create_queues_job_with_request() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(triad(), now);
        let record = f.jobs.job(job).unwrap();
        assert_eq!(record.state, JobState::Queued);
        assert_eq!(record.keepalive_timestamp, now);
        assert_eq!(record.keepalive_interval, Duration::seconds(60));
        let req = f.db.read(|t| t.job_requests.values().next().cloned()).unwrap();
        assert_eq!(req.job_id, job);
        assert_eq!(req.priority, 1);
    }

    #[test]
    fn invalid_requests_store_nothing() {
        let f = fixture(1, 1, None);
        let now = Utc::now();

        let mut bad_machine = f.request(triad());
        bad_machine.machine = Some("nope".into());
        let bad_shape = f.request(AllocationShape::Rectangle {
            width: 2,
            height: 1,
            depth: None,
        });
        let bad_board = f.request(AllocationShape::SingleBoard(Some(BoardLocator::Triad(
            TriadCoords::new(0, 0, 5),
        ))));
        let mut outsider = f.request(triad());
        outsider.owner = f.db.write_user("stranger");

        for req in [bad_machine, bad_shape, bad_board, outsider] {
            assert!(matches!(f.jobs.create_job(req, now), Err(JobError::Validation(_))));
        }
        assert!(f.db.read(|t| t.jobs.is_empty() && t.job_requests.is_empty()));
    }

    #[test]
    fn machine_can_be_chosen_by_tags() {
        let f = fixture(1, 1, None);
        f.db
            .transaction(|t| {
                t.machines.values_mut().for_each(|m| {
                    m.tags.insert("default".into());
                });
                Ok::<_, DbError>(())
            })
            .unwrap();
        let mut req = f.request(single());
        req.machine = None;
        req.tags = BTreeSet::from(["default".to_string()]);
        assert!(f.jobs.create_job(req.clone(), Utc::now()).is_ok());

        req.tags = BTreeSet::from(["gpu".to_string()]);
        assert!(matches!(
            f.jobs.create_job(req, Utc::now()),
            Err(JobError::Validation(_))
        ));
    }

    #[test]
    fn quota_fast_fail_at_creation() {
        // One triad (3 boards) for 60 s needs 180 board-seconds.
        let f = fixture(1, 1, Some(179));
        let err = f.jobs.create_job(f.request(triad()), Utc::now()).unwrap_err();
        assert!(matches!(
            err,
            JobError::Allocation(AllocationError::QuotaExceeded { projected: 180, .. })
        ));
        assert!(f.db.read(|t| t.jobs.is_empty()));
        assert!(f.db.read(|t| t.boards.values().all(|b| b.owner.is_none())));
    }

    #[test]
    fn keepalive_is_clamped_to_policy() {
        let f = fixture(1, 1, None);
        let mut req = f.request(single());
        req.keepalive_interval = Some(Duration::seconds(1));
        let job = f.jobs.create_job(req, Utc::now()).unwrap();
        assert_eq!(f.jobs.job(job).unwrap().keepalive_interval, Duration::seconds(30));
    }

    // ── Allocation rounds ─────────────────────────────────────────────────────

    #[test]
    fn allocation_queues_power_on_with_perimeter_links() {
        let f = fixture(2, 1, None);
        let now = Utc::now();
        let job = f.create(triad(), now);

        let round = f.jobs.allocate_queued(now);
        assert_eq!(round.allocated, vec![job]);
        assert_eq!(f.state(job), JobState::PowerPending);

        let changes = f.changes(job);
        assert_eq!(changes.len(), 3);
        assert!(changes.iter().all(|c| c.power == PowerCommand::On
            && c.to_state == JobState::Ready
            && !c.in_progress));
        // (0,0,1) has an east link into the neighbouring triad.
        let z1 = f
            .db
            .read(|t| t.board_at(1, TriadCoords::new(0, 0, 1)).map(|b| b.id))
            .unwrap();
        let z1_change = changes.iter().find(|c| c.board_id == z1).unwrap();
        assert!(z1_change.stop_links.contains(&Direction::East));
    }

    #[test]
    fn unsatisfiable_job_stays_queued_and_gains_importance() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let first = f.create(triad(), now);
        let second = f.create(triad(), now);

        let round = f.jobs.allocate_queued(now);
        assert_eq!(round.allocated, vec![first]);
        assert_eq!(round.still_queued, vec![second]);
        assert_eq!(f.state(second), JobState::Queued);

        let importance = f.db.read(|t| t.job_requests.values().next().map(|r| r.importance));
        assert_eq!(importance, Some(1));
        f.jobs.allocate_queued(now);
        let importance = f.db.read(|t| t.job_requests.values().next().map(|r| r.importance));
        assert_eq!(importance, Some(2));
    }

    #[test]
    fn requests_outside_importance_span_are_deferred() {
        let mut f = fixture(2, 1, None);
        f.jobs = JobManager::new(
            Arc::clone(&f.db),
            JobPolicy {
                importance_span: 5,
                ..JobPolicy::default()
            },
        );
        let now = Utc::now();
        let low = f.create(single(), now);
        let high = f.create(single(), now);
        f.db
            .transaction(|t| {
                for r in t.job_requests.values_mut() {
                    r.importance = if r.job_id == high { 100 } else { 0 };
                }
                Ok::<_, DbError>(())
            })
            .unwrap();

        let round = f.jobs.allocate_queued(now);
        assert_eq!(round.allocated, vec![high]);
        assert_eq!(round.deferred, vec![low]);
        assert_eq!(f.state(low), JobState::Queued);
    }

    #[test]
    fn more_important_request_is_served_first() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let early = f.create(triad(), now);
        let urgent = f.create(triad(), now);
        f.db
            .transaction(|t| {
                for r in t.job_requests.values_mut() {
                    if r.job_id == urgent {
                        r.importance = 3;
                    }
                }
                Ok::<_, DbError>(())
            })
            .unwrap();
        let round = f.jobs.allocate_queued(now);
        assert_eq!(round.allocated, vec![urgent]);
        assert_eq!(round.still_queued, vec![early]);
    }

    #[test]
    fn request_past_retry_window_is_destroyed() {
        let f = fixture(1, 1, None);
        let then = Utc::now();
        let holder = f.create(triad(), then);
        let waiter = f.create(triad(), then);
        f.jobs.allocate_queued(then);

        let later = then + Duration::hours(2);
        f.jobs.keepalive(holder, None, later).unwrap();
        let round = f.jobs.allocate_queued(later);
        assert_eq!(round.destroyed, vec![waiter]);
        let record = f.jobs.job(waiter).unwrap();
        assert_eq!(record.state, JobState::Destroyed);
        assert_eq!(record.death_reason.as_deref(), Some(REASON_NO_REGION));
    }

    // ── Power completion ──────────────────────────────────────────────────────

    #[test]
    fn successful_power_makes_job_ready() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(single(), now);
        f.jobs.allocate_queued(now);
        f.complete_power(job, now);
        assert_eq!(f.state(job), JobState::Ready);
    }

    #[test]
    fn failed_power_destroys_and_flags_boards() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(triad(), now);
        f.jobs.allocate_queued(now);
        let boards = f.db.read(|t| t.boards_owned_by(job));

        f.jobs
            .power_completed(
                job,
                PowerOutcome::Failed {
                    reason: "BMP unreachable".into(),
                    boards: boards.clone(),
                },
                now,
            )
            .unwrap();
        let record = f.jobs.job(job).unwrap();
        assert_eq!(record.state, JobState::Destroyed);
        assert_eq!(record.death_reason.as_deref(), Some("power on failed: BMP unreachable"));
        assert!(f.db.read(|t| boards.iter().all(|b| t.boards[b].needs_check)));
        assert!(f.db.read(|t| t.boards_owned_by(job).is_empty()));
    }

    #[test]
    fn completion_does_not_revive_destroyed_job() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(single(), now);
        f.jobs.allocate_queued(now);
        f.jobs.destroy_job(job, "user request", now).unwrap();
        f.complete_power(job, now);
        assert_eq!(f.state(job), JobState::Destroyed);
    }

    // ── Destroy ───────────────────────────────────────────────────────────────

    #[test]
    fn destroy_is_idempotent() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(single(), now);
        assert!(f.jobs.destroy_job(job, "done", now).unwrap());
        assert!(!f.jobs.destroy_job(job, "again", now).unwrap());
        assert!(!f.jobs.destroy_job(999, "ghost", now).unwrap());
        assert_eq!(f.jobs.job(job).unwrap().death_reason.as_deref(), Some("done"));
        assert!(f.db.read(|t| t.job_requests.is_empty()));
    }

    #[test]
    fn destroy_during_power_pending_cancels_queued_power_on() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(triad(), now);
        f.jobs.allocate_queued(now);

        // The controller has started on one board only.
        let started = f
            .db
            .transaction(|t| {
                let c = t.pending_changes.values_mut().next().ok_or(DbError::NoSuchBoard(0))?;
                c.in_progress = true;
                Ok::<_, DbError>(c.board_id)
            })
            .unwrap();

        assert!(f.jobs.destroy_job(job, "cancelled", now).unwrap());
        let changes = f.changes(job);
        let on: Vec<_> = changes.iter().filter(|c| c.power == PowerCommand::On).collect();
        let off: Vec<_> = changes.iter().filter(|c| c.power == PowerCommand::Off).collect();
        assert_eq!(on.len(), 1);
        assert!(on[0].in_progress);
        assert_eq!(off.len(), 1);
        assert_eq!(off[0].board_id, started);
        assert!(off[0].id > on[0].id);
        assert!(f.db.read(|t| t.boards_owned_by(job).is_empty()));
    }

    #[test]
    fn destroy_of_ready_job_powers_off_its_boards() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(triad(), now);
        f.jobs.allocate_queued(now);
        f.complete_power(job, now);

        f.jobs.destroy_job(job, "finished", now).unwrap();
        let off = f.changes(job);
        assert_eq!(off.len(), 3);
        assert!(off.iter().all(|c| c.power == PowerCommand::Off));
    }

    #[test]
    fn destroy_charges_quota() {
        let f = fixture(1, 1, Some(10_000));
        let then = Utc::now();
        let job = f.create(single(), then);
        f.jobs.allocate_queued(then);
        f.jobs.destroy_job(job, "done", then + Duration::seconds(100)).unwrap();
        assert!(f.jobs.job(job).unwrap().accounted_for);
        assert_eq!(f.db.read(|t| t.groups[&f.group].quota), Some(9_900));
    }

    // ── Sweeps ────────────────────────────────────────────────────────────────

    #[test]
    fn lapsed_keepalive_destroys_and_frees_boards() {
        let f = fixture(1, 1, None);
        let then = Utc::now();
        let job = f.create(triad(), then);
        f.jobs.allocate_queued(then);
        f.complete_power(job, then);
        assert_eq!(f.state(job), JobState::Ready);

        assert!(f.jobs.expire_jobs(then + Duration::seconds(30)).is_empty());
        let later = then + Duration::seconds(61);
        assert_eq!(f.jobs.expire_jobs(later), vec![job]);
        let record = f.jobs.job(job).unwrap();
        assert_eq!(record.state, JobState::Destroyed);
        assert_eq!(record.death_reason.as_deref(), Some(REASON_KEEPALIVE));

        let next = f.create(triad(), later);
        assert_eq!(f.jobs.allocate_queued(later).allocated, vec![next]);
    }

    #[test]
    fn refreshed_keepalive_survives_sweep() {
        let f = fixture(1, 1, None);
        let then = Utc::now();
        let job = f.create(single(), then);
        f.jobs.keepalive(job, Some("host-a"), then + Duration::seconds(50)).unwrap();
        assert!(f.jobs.expire_jobs(then + Duration::seconds(90)).is_empty());
        assert_eq!(f.jobs.job(job).unwrap().keepalive_host.as_deref(), Some("host-a"));
    }

    #[test]
    fn keepalive_on_dead_or_missing_job_fails() {
        let f = fixture(1, 1, None);
        let now = Utc::now();
        let job = f.create(single(), now);
        f.jobs.destroy_job(job, "gone", now).unwrap();
        assert!(matches!(
            f.jobs.keepalive(job, None, now),
            Err(JobError::Destroyed { reason, .. }) if reason == "gone"
        ));
        assert!(matches!(f.jobs.keepalive(77, None, now), Err(JobError::NotFound(77))));
    }

    #[test]
    fn overdrawn_group_jobs_are_destroyed() {
        // 3 boards for 60 s fits exactly; running 70 s overdraws.
        let f = fixture(1, 1, Some(180));
        let then = Utc::now();
        let job = f.create(triad(), then);
        f.jobs.allocate_queued(then);
        f.complete_power(job, then);

        let later = then + Duration::seconds(70);
        f.jobs.keepalive(job, None, later).unwrap();
        assert_eq!(f.jobs.expire_jobs(later), vec![job]);
        assert_eq!(f.jobs.job(job).unwrap().death_reason.as_deref(), Some(REASON_QUOTA));
    }

    #[test]
    fn emergency_stop_kills_everything_powered() {
        let f = fixture(2, 1, None);
        let now = Utc::now();
        let a = f.create(triad(), now);
        let b = f.create(triad(), now);
        f.jobs.allocate_queued(now);
        f.complete_power(a, now);

        let stopped = f.jobs.emergency_stop(now).unwrap();
        assert_eq!(stopped, vec![a, b]);
        assert!(f.db.read(|t| t
            .pending_changes
            .values()
            .all(|c| c.power == PowerCommand::Off)));
        assert_eq!(f.changes(a).len(), 3);
        assert!(f.changes(b).is_empty());
    }

    impl Database {
        fn write_user(&self, name: &str) -> UserId {
            self.transaction(|t| {
                let u = t.add_user(name, None);
                let g = t.add_group(name, GroupType::Internal, None);
                t.add_membership(u, g)?;
                Ok::<_, DbError>(u)
            })
            .unwrap()
        }
    }
}
