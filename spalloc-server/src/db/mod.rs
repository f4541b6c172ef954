/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory transactional store.
//!
//! [`Tables`] mirrors the relational schema the allocator is specified
//! against: one field per table, keyed by the table's primary key.
//! [`Database`] wraps it in a mutex; [`Database::transaction`] runs a
//! closure with exclusive access and restores the previous contents if the
//! closure fails, so a failed operation never leaves partial changes.
//!
//! | Table | Field |
//! |---|---|
//! | `machines` | [`Tables::machines`] |
//! | `boards` | [`Tables::boards`] |
//! | `board_links` (dead) | [`Tables::board_links`] |
//! | `jobs` | [`Tables::jobs`] |
//! | `job_request` | [`Tables::job_requests`] |
//! | `pending_changes` | [`Tables::pending_changes`] |
//! | `groups` / `users` / `group_memberships` | [`Tables::groups`], [`Tables::users`], [`Tables::group_memberships`] |
//! | `blacklisted_chips` / `_cores` / `_links` | see [`blacklist`] |

pub mod blacklist;
pub mod groups;

pub use blacklist::BlacklistStore;
pub use groups::{GroupRecord, GroupType, IntegrityError, UserRecord};

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use spalloc_comms::{BmpCoords, ChipLocation, Direction, PowerCommand};
use thiserror::Error;

use crate::allocator::{AllocationRequest, BoardLocator};
use crate::jobs::JobState;
use crate::topology::{MachineGeometry, MachineLayout, PhysicalCoords, TriadCoords};

pub type MachineId = u32;
pub type BoardId = u32;
pub type JobId = u64;
pub type RequestId = u64;
pub type ChangeId = u64;
pub type GroupId = u32;
pub type UserId = u32;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    #[error("no such machine: '{0}'")]
    NoSuchMachine(String),

    #[error("no such board: {0}")]
    NoSuchBoard(BoardId),

    #[error("no such group: {0}")]
    NoSuchGroup(GroupId),

    #[error("no such user: {0}")]
    NoSuchUser(UserId),

    #[error("duplicate {what}: '{key}'")]
    Duplicate { what: &'static str, key: String },

    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

// ── Rows ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub id: MachineId,
    pub name: String,
    pub tags: BTreeSet<String>,
    pub layout: MachineLayout,
    pub in_service: bool,
    pub bmp_addresses: BTreeMap<BmpCoords, IpAddr>,
}

impl MachineRecord {
    pub fn geometry(&self) -> &MachineGeometry {
        &self.layout.geometry
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardRecord {
    pub id: BoardId,
    pub machine_id: MachineId,
    pub triad: TriadCoords,
    pub physical: PhysicalCoords,
    pub address: Option<IpAddr>,
    pub functioning: bool,
    pub owner: Option<JobId>,
    pub powered: bool,
    pub power_on_timestamp: Option<DateTime<Utc>>,
    pub power_off_timestamp: Option<DateTime<Utc>>,
    /// A BMP operation on this board failed terminally.
    pub needs_check: bool,
    pub bmp_serial: Option<String>,
    pub blacklist_set: Option<DateTime<Utc>>,
    pub blacklist_sync: Option<DateTime<Utc>>,
}

impl BoardRecord {
    /// The stored blacklist was edited after it last reached the board.
    pub fn blacklist_unsynced(&self) -> bool {
        match (self.blacklist_set, self.blacklist_sync) {
            (Some(set), Some(sync)) => set > sync,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    pub machine_id: MachineId,
    pub owner: UserId,
    pub group_id: GroupId,
    pub state: JobState,
    pub root_id: Option<BoardId>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub depth: Option<u32>,
    pub allocation_size: Option<u32>,
    pub keepalive_interval: Duration,
    pub keepalive_timestamp: DateTime<Utc>,
    pub keepalive_host: Option<String>,
    pub create_timestamp: DateTime<Utc>,
    pub allocation_timestamp: Option<DateTime<Utc>>,
    pub death_timestamp: Option<DateTime<Utc>>,
    pub death_reason: Option<String>,
    pub accounted_for: bool,
    pub original_request: Vec<u8>,
}

impl JobRecord {
    /// Board-seconds consumed so far; live jobs are billed up to `now`.
    pub fn usage(&self, now: DateTime<Utc>) -> i64 {
        let (Some(size), Some(start)) = (self.allocation_size, self.allocation_timestamp) else {
            return 0;
        };
        let end = self.death_timestamp.unwrap_or(now);
        i64::from(size) * (end - start).num_seconds().max(0)
    }
}

/// A queued allocation request (`job_request` row).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequestRecord {
    pub id: RequestId,
    pub job_id: JobId,
    pub request: AllocationRequest,
    pub importance: i64,
    pub priority: i64,
}

/// One board power change awaiting the BMP controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    pub id: ChangeId,
    /// `None` for changes not tied to a job (e.g. an emergency stop).
    pub job_id: Option<JobId>,
    pub board_id: BoardId,
    pub power: PowerCommand,
    pub from_state: JobState,
    pub to_state: JobState,
    /// Board-edge links leaving the allocation, switched off after power-on.
    pub stop_links: Vec<Direction>,
    pub in_progress: bool,
}

// ── Tables ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
struct Sequences {
    machine: MachineId,
    board: BoardId,
    job: JobId,
    request: RequestId,
    change: ChangeId,
    group: GroupId,
    user: UserId,
}

fn bump<T: Copy + std::ops::AddAssign + From<u8>>(counter: &mut T) -> T {
    *counter += T::from(1u8);
    *counter
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub machines: BTreeMap<MachineId, MachineRecord>,
    pub boards: BTreeMap<BoardId, BoardRecord>,
    /// Board-edge links declared dead, by the board at either end.
    pub board_links: BTreeSet<(BoardId, Direction)>,
    pub jobs: BTreeMap<JobId, JobRecord>,
    pub job_requests: BTreeMap<RequestId, JobRequestRecord>,
    pub pending_changes: BTreeMap<ChangeId, PendingChange>,
    pub groups: BTreeMap<GroupId, GroupRecord>,
    pub users: BTreeMap<UserId, UserRecord>,
    pub group_memberships: BTreeSet<(UserId, GroupId)>,
    pub blacklisted_chips: BTreeSet<(BoardId, ChipLocation)>,
    pub blacklisted_cores: BTreeSet<(BoardId, ChipLocation, u32)>,
    pub blacklisted_links: BTreeSet<(BoardId, ChipLocation, Direction)>,
    board_index: BTreeMap<(MachineId, TriadCoords), BoardId>,
    sequences: Sequences,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Machines and boards ───────────────────────────────────────────────────

    pub fn add_machine(
        &mut self,
        name: &str,
        tags: BTreeSet<String>,
        layout: MachineLayout,
        bmp_addresses: BTreeMap<BmpCoords, IpAddr>,
    ) -> Result<MachineId, DbError> {
        if self.machine_by_name(name).is_some() {
            return Err(DbError::Duplicate {
                what: "machine",
                key: name.to_string(),
            });
        }
        let id = bump(&mut self.sequences.machine);
        self.machines.insert(
            id,
            MachineRecord {
                id,
                name: name.to_string(),
                tags,
                layout,
                in_service: true,
                bmp_addresses,
            },
        );
        Ok(id)
    }

    pub fn machine_by_name(&self, name: &str) -> Option<&MachineRecord> {
        self.machines.values().find(|m| m.name == name)
    }

    pub fn add_board(
        &mut self,
        machine_id: MachineId,
        triad: TriadCoords,
        physical: PhysicalCoords,
        address: Option<IpAddr>,
        functioning: bool,
    ) -> Result<BoardId, DbError> {
        if !self.machines.contains_key(&machine_id) {
            return Err(DbError::NoSuchMachine(machine_id.to_string()));
        }
        if self.board_index.contains_key(&(machine_id, triad)) {
            return Err(DbError::Duplicate {
                what: "board",
                key: triad.to_string(),
            });
        }
        let id = bump(&mut self.sequences.board);
        self.boards.insert(
            id,
            BoardRecord {
                id,
                machine_id,
                triad,
                physical,
                address,
                functioning,
                owner: None,
                powered: false,
                power_on_timestamp: None,
                power_off_timestamp: None,
                needs_check: false,
                bmp_serial: None,
                blacklist_set: None,
                blacklist_sync: None,
            },
        );
        self.board_index.insert((machine_id, triad), id);
        Ok(id)
    }

    pub fn board_at(&self, machine_id: MachineId, triad: TriadCoords) -> Option<&BoardRecord> {
        self.board_index
            .get(&(machine_id, triad))
            .and_then(|id| self.boards.get(id))
    }

    pub fn boards_of(&self, machine_id: MachineId) -> impl Iterator<Item = &BoardRecord> {
        self.boards.values().filter(move |b| b.machine_id == machine_id)
    }

    pub fn boards_owned_by(&self, job: JobId) -> Vec<BoardId> {
        self.boards
            .values()
            .filter(|b| b.owner == Some(job))
            .map(|b| b.id)
            .collect()
    }

    /// Record the link leaving `board` towards `direction` as dead.
    pub fn add_dead_link(&mut self, board: BoardId, direction: Direction) -> Result<(), DbError> {
        if !self.boards.contains_key(&board) {
            return Err(DbError::NoSuchBoard(board));
        }
        self.board_links.insert((board, direction));
        Ok(())
    }

    pub fn resolve_locator(&self, machine_id: MachineId, locator: &BoardLocator) -> Option<BoardId> {
        match locator {
            BoardLocator::Triad(t) => self.board_at(machine_id, *t).map(|b| b.id),
            BoardLocator::Physical(p) => self
                .boards_of(machine_id)
                .find(|b| b.physical == *p)
                .map(|b| b.id),
            BoardLocator::Address(ip) => self
                .boards_of(machine_id)
                .find(|b| b.address == Some(*ip))
                .map(|b| b.id),
        }
    }

    pub fn board(&self, id: BoardId) -> Result<&BoardRecord, DbError> {
        self.boards.get(&id).ok_or(DbError::NoSuchBoard(id))
    }

    pub fn board_mut(&mut self, id: BoardId) -> Result<&mut BoardRecord, DbError> {
        self.boards.get_mut(&id).ok_or(DbError::NoSuchBoard(id))
    }

    // ── Groups and users ──────────────────────────────────────────────────────

    pub fn add_group(&mut self, name: &str, group_type: GroupType, quota: Option<i64>) -> GroupId {
        let id = bump(&mut self.sequences.group);
        self.groups.insert(
            id,
            GroupRecord {
                id,
                name: name.to_string(),
                group_type,
                quota,
            },
        );
        id
    }

    pub fn add_user(&mut self, name: &str, openid_subject: Option<&str>) -> UserId {
        let id = bump(&mut self.sequences.user);
        self.users.insert(
            id,
            UserRecord {
                id,
                name: name.to_string(),
                openid_subject: openid_subject.map(str::to_string),
            },
        );
        id
    }

    pub fn add_membership(&mut self, user: UserId, group: GroupId) -> Result<(), DbError> {
        let u = self.users.get(&user).ok_or(DbError::NoSuchUser(user))?;
        let g = self.groups.get(&group).ok_or(DbError::NoSuchGroup(group))?;
        groups::check_membership(u, g)?;
        self.group_memberships.insert((user, group));
        Ok(())
    }

    pub fn is_member(&self, user: UserId, group: GroupId) -> bool {
        self.group_memberships.contains(&(user, group))
    }

    /// Change a group's type; every existing member must still fit.
    pub fn set_group_type(&mut self, group: GroupId, group_type: GroupType) -> Result<(), DbError> {
        let mut candidate = self
            .groups
            .get(&group)
            .cloned()
            .ok_or(DbError::NoSuchGroup(group))?;
        candidate.group_type = group_type;
        for (user, _) in self.group_memberships.iter().filter(|(_, g)| *g == group) {
            let u = self.users.get(user).ok_or(DbError::NoSuchUser(*user))?;
            groups::check_membership(u, &candidate)?;
        }
        self.groups.insert(group, candidate);
        Ok(())
    }

    /// Change a user's OpenID subject (and so whether they are internal);
    /// every existing membership must still fit.
    pub fn set_openid_subject(&mut self, user: UserId, subject: Option<&str>) -> Result<(), DbError> {
        let mut candidate = self
            .users
            .get(&user)
            .cloned()
            .ok_or(DbError::NoSuchUser(user))?;
        candidate.openid_subject = subject.map(str::to_string);
        for (_, group) in self.group_memberships.iter().filter(|(u, _)| *u == user) {
            let g = self.groups.get(group).ok_or(DbError::NoSuchGroup(*group))?;
            groups::check_membership(&candidate, g)?;
        }
        self.users.insert(user, candidate);
        Ok(())
    }

    // ── Jobs and changes ──────────────────────────────────────────────────────

    pub fn next_job_id(&mut self) -> JobId {
        bump(&mut self.sequences.job)
    }

    pub fn next_request_id(&mut self) -> RequestId {
        bump(&mut self.sequences.request)
    }

    /// Append a power change; ids are monotonic so they double as the
    /// per-board submission order.
    #[allow(clippy::too_many_arguments)]
    pub fn queue_change(
        &mut self,
        job_id: Option<JobId>,
        board_id: BoardId,
        power: PowerCommand,
        from_state: JobState,
        to_state: JobState,
        stop_links: Vec<Direction>,
    ) -> ChangeId {
        let id = bump(&mut self.sequences.change);
        self.pending_changes.insert(
            id,
            PendingChange {
                id,
                job_id,
                board_id,
                power,
                from_state,
                to_state,
                stop_links,
                in_progress: false,
            },
        );
        id
    }

    pub fn changes_for_job(&self, job: JobId) -> impl Iterator<Item = &PendingChange> {
        self.pending_changes
            .values()
            .filter(move |c| c.job_id == Some(job))
    }
}

// ── Database ──────────────────────────────────────────────────────────────────

/// The shared store: one lock, all-or-nothing transactions.
#[derive(Debug, Default)]
pub struct Database {
    tables: Mutex<Tables>,
}

impl Database {
    pub fn new(tables: Tables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // A panicking writer never commits half a transaction (see
        // `transaction`), so the data behind a poisoned lock is consistent.
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` against a consistent view of the tables.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        f(&self.lock())
    }

    /// Run `f` with exclusive access; on `Err` every change `f` made is
    /// rolled back.
    pub fn transaction<R, E>(&self, f: impl FnOnce(&mut Tables) -> Result<R, E>) -> Result<R, E> {
        let mut tables = self.lock();
        let saved = tables.clone();
        let result = f(&mut tables);
        if result.is_err() {
            *tables = saved;
        }
        result
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn one_board_tables() -> (Tables, MachineId, BoardId) {
        let mut t = Tables::new();
        let geometry = MachineGeometry {
            width: 1,
            height: 1,
            depth: 1,
            wraps: false,
        };
        let m = t
            .add_machine("m", BTreeSet::new(), MachineLayout::new(geometry), BTreeMap::new())
            .unwrap();
        let b = t
            .add_board(m, TriadCoords::new(0, 0, 0), PhysicalCoords::new(0, 0, 0), None, true)
            .unwrap();
        (t, m, b)
    }

    // ── Transactions ──────────────────────────────────────────────────────────

    #[test]
    fn failed_transaction_rolls_back() {
        let (t, _, b) = one_board_tables();
        let db = Database::new(t);
        let result: Result<(), DbError> = db.transaction(|t| {
            t.board_mut(b)?.owner = Some(7);
            Err(DbError::NoSuchBoard(99))
        });
        assert!(result.is_err());
        assert_eq!(db.read(|t| t.boards[&b].owner), None);
    }

    #[test]
    fn successful_transaction_commits() {
        let (t, _, b) = one_board_tables();
        let db = Database::new(t);
        db.transaction(|t| -> Result<(), DbError> {
            t.board_mut(b)?.owner = Some(7);
            Ok(())
        })
        .unwrap();
        assert_eq!(db.read(|t| t.boards_owned_by(7)), vec![b]);
    }

    // ── Boards ────────────────────────────────────────────────────────────────

    #[test]
    fn duplicate_machines_and_boards_are_rejected() {
        let (mut t, m, _) = one_board_tables();
        let layout = t.machines[&m].layout.clone();
        assert!(matches!(
            t.add_machine("m", BTreeSet::new(), layout, BTreeMap::new()),
            Err(DbError::Duplicate { what: "machine", .. })
        ));
        assert!(t
            .add_board(m, TriadCoords::new(0, 0, 0), PhysicalCoords::new(0, 0, 1), None, true)
            .is_err());
    }

    #[test]
    fn blacklist_edits_stay_unsynced_until_they_reach_the_board() {
        let (mut t, _, b) = one_board_tables();
        assert!(!t.boards[&b].blacklist_unsynced());

        let edited = Utc::now();
        t.board_mut(b).unwrap().blacklist_set = Some(edited);
        assert!(t.boards[&b].blacklist_unsynced());

        t.board_mut(b).unwrap().blacklist_sync = Some(edited);
        assert!(!t.boards[&b].blacklist_unsynced());

        t.board_mut(b).unwrap().blacklist_set = Some(edited + Duration::seconds(1));
        assert!(t.boards[&b].blacklist_unsynced());
    }

    #[test]
    fn locators_resolve_by_any_coordinate() {
        let (mut t, m, b) = one_board_tables();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        t.board_mut(b).unwrap().address = Some(ip);
        assert_eq!(t.resolve_locator(m, &BoardLocator::Triad(TriadCoords::new(0, 0, 0))), Some(b));
        assert_eq!(
            t.resolve_locator(m, &BoardLocator::Physical(PhysicalCoords::new(0, 0, 0))),
            Some(b)
        );
        assert_eq!(t.resolve_locator(m, &BoardLocator::Address(ip)), Some(b));
        assert_eq!(t.resolve_locator(m, &BoardLocator::Triad(TriadCoords::new(0, 1, 0))), None);
    }

    // ── Membership rule ───────────────────────────────────────────────────────

    #[test]
    fn membership_type_mismatch_is_integrity_error() {
        let mut t = Tables::new();
        let internal = t.add_group("staff", GroupType::Internal, None);
        let collab = t.add_group("hbp", GroupType::Collaboratory, Some(100));
        let local = t.add_user("root", None);
        let remote = t.add_user("ext", Some("oidc|123"));

        t.add_membership(local, internal).unwrap();
        t.add_membership(remote, collab).unwrap();
        assert!(matches!(
            t.add_membership(local, collab),
            Err(DbError::Integrity(_))
        ));
        assert!(!t.is_member(local, collab));
    }

    #[test]
    fn retyping_a_group_or_user_rechecks_members() {
        let mut t = Tables::new();
        let g = t.add_group("staff", GroupType::Internal, None);
        let u = t.add_user("root", None);
        t.add_membership(u, g).unwrap();

        assert!(matches!(
            t.set_group_type(g, GroupType::Organisation),
            Err(DbError::Integrity(_))
        ));
        assert_eq!(t.groups[&g].group_type, GroupType::Internal);
        assert!(matches!(
            t.set_openid_subject(u, Some("oidc|1")),
            Err(DbError::Integrity(_))
        ));
        assert!(t.users[&u].is_internal());
    }

    // ── Usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn usage_is_size_times_duration() {
        let now = Utc::now();
        let mut job = JobRecord {
            id: 1,
            machine_id: 1,
            owner: 1,
            group_id: 1,
            state: JobState::Ready,
            root_id: None,
            width: None,
            height: None,
            depth: None,
            allocation_size: None,
            keepalive_interval: Duration::seconds(60),
            keepalive_timestamp: now,
            keepalive_host: None,
            create_timestamp: now,
            allocation_timestamp: None,
            death_timestamp: None,
            death_reason: None,
            accounted_for: false,
            original_request: Vec::new(),
        };
        assert_eq!(job.usage(now), 0);
        job.allocation_size = Some(3);
        job.allocation_timestamp = Some(now - Duration::seconds(100));
        assert_eq!(job.usage(now), 300);
        job.death_timestamp = Some(now - Duration::seconds(50));
        assert_eq!(job.usage(now), 150);
    }
}
