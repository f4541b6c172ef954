/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Allocation engine: finds and reserves a block of boards for a job.
//!
//! [`AllocationEngine::allocate`] runs in two phases:
//!
//! 1. **Search**, lock-free, over a [`HealthSnapshot`]: enumerate candidate
//!    blocks for the requested shape, verify each one, rank the survivors.
//! 2. **Reserve**, in one store transaction: re-check every chosen board is
//!    still usable, set its owner, and move the job to `ALLOCATED`.
//!
//! If a board was claimed between the two phases the search runs once more
//! on a fresh snapshot before giving up with
//! [`AllocationError::AllocationConflict`].
//!
//! # Ranking
//!
//! Survivors are ordered by
//!
//! | Key | Preference |
//! |---|---|
//! | dead resources (blacklist entries, dead internal links, unusable positions) | fewest |
//! | root `(z, y, x)` | smallest |
//!
//! Candidates are generated in a fixed order and every key is a pure
//! function of the snapshot, so repeated runs pick the same block.

pub mod error;
pub mod estimate;
pub mod quota;

pub use error::{AllocationError, RejectReason};
pub use estimate::DimensionEstimate;
pub use quota::{JobUsage, QuotaManager, UserQuota};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use spalloc_comms::Direction;
use tracing::{debug, info, warn};

use crate::db::{BoardId, Database, JobId, MachineId, Tables};
use crate::health::{board_usable, HealthSnapshot};
use crate::jobs::JobState;
use crate::topology::{block_members, neighbours, MachineGeometry, PhysicalCoords, TriadCoords};

// ── Requests ──────────────────────────────────────────────────────────────────

/// How a single board is named in a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoardLocator {
    Triad(TriadCoords),
    Physical(PhysicalCoords),
    Address(IpAddr),
}

impl fmt::Display for BoardLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoardLocator::Triad(t) => write!(f, "{t}"),
            BoardLocator::Physical(p) => write!(f, "{p}"),
            BoardLocator::Address(ip) => write!(f, "{ip}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocationShape {
    /// Exactly these boards, which must be connected.
    Boards(Vec<BoardLocator>),
    /// `width × height` triads; `depth` 1 asks for a single board.
    Rectangle {
        width: u32,
        height: u32,
        depth: Option<u32>,
    },
    /// A rectangle of whole triads rooted at `root`.
    RootedRectangle {
        root: TriadCoords,
        width: u32,
        height: u32,
    },
    /// At least this many boards, in a near-square block.
    NumBoards(u32),
    /// Any one board, or the named one.
    SingleBoard(Option<BoardLocator>),
}

impl AllocationShape {
    /// Reject shapes that could never be satisfied on this machine.
    pub fn validate(&self, geometry: &MachineGeometry) -> Result<(), AllocationError> {
        let invalid = |msg: String| Err(AllocationError::InvalidShape(msg));
        match self {
            AllocationShape::Boards(list) if list.is_empty() => invalid("empty board list".into()),
            AllocationShape::Boards(_) | AllocationShape::SingleBoard(_) => Ok(()),
            AllocationShape::Rectangle {
                width,
                height,
                depth,
            } => {
                if *width == 0 || *height == 0 {
                    return invalid(format!("{width}x{height} has no boards"));
                }
                if *width > geometry.width || *height > geometry.height {
                    return invalid(format!(
                        "{width}x{height} exceeds {}x{} machine",
                        geometry.width, geometry.height
                    ));
                }
                match depth {
                    Some(1) if (*width, *height) != (1, 1) => {
                        invalid("depth 1 is only valid for a 1x1 request".into())
                    }
                    Some(d) if *d != 1 && *d != geometry.depth => {
                        invalid(format!("depth {d} on a machine of depth {}", geometry.depth))
                    }
                    _ => Ok(()),
                }
            }
            AllocationShape::RootedRectangle {
                root,
                width,
                height,
            } => {
                if *width == 0 || *height == 0 {
                    return invalid(format!("{width}x{height} has no boards"));
                }
                if root.z != 0 || !geometry.contains(*root) {
                    return invalid(format!("{root} is not a triad root of this machine"));
                }
                let fits = if geometry.wraps {
                    *width <= geometry.width && *height <= geometry.height
                } else {
                    root.x + width <= geometry.width && root.y + height <= geometry.height
                };
                if fits {
                    Ok(())
                } else {
                    invalid(format!("{width}x{height} at {root} leaves the machine"))
                }
            }
            AllocationShape::NumBoards(n) => DimensionEstimate::for_boards(*n, geometry).map(|_| ()),
        }
    }

    /// Upper bound on the boards this shape can hold, for quota projection.
    pub fn max_boards(&self, geometry: &MachineGeometry) -> u32 {
        match self {
            AllocationShape::Boards(list) => list.len() as u32,
            AllocationShape::Rectangle {
                width,
                height,
                depth,
            } => width * height * depth.unwrap_or(geometry.depth),
            AllocationShape::RootedRectangle { width, height, .. } => {
                width * height * geometry.depth
            }
            AllocationShape::NumBoards(n) => DimensionEstimate::for_boards(*n, geometry)
                .map(|e| e.size())
                .unwrap_or(*n),
            AllocationShape::SingleBoard(_) => 1,
        }
    }
}

/// A shape plus how many of its positions may be missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub shape: AllocationShape,
    pub max_dead_boards: u32,
}

/// What the engine reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub machine_id: MachineId,
    pub root: TriadCoords,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub boards: Vec<(BoardId, TriadCoords)>,
}

impl Allocation {
    pub fn board_ids(&self) -> Vec<BoardId> {
        self.boards.iter().map(|(id, _)| *id).collect()
    }

    /// Board links that leave the allocation, per board.
    pub fn perimeter_links(&self, geometry: &MachineGeometry) -> BTreeMap<BoardId, Vec<Direction>> {
        let inside: BTreeSet<TriadCoords> = self.boards.iter().map(|(_, t)| *t).collect();
        self.boards
            .iter()
            .map(|(id, t)| {
                let out = neighbours(geometry, *t)
                    .into_iter()
                    .filter(|(_, n)| !inside.contains(n))
                    .map(|(d, _)| d)
                    .collect();
                (*id, out)
            })
            .collect()
    }
}

// ── Search ────────────────────────────────────────────────────────────────────

/// One candidate block.
#[derive(Debug, Clone)]
struct Block {
    root: TriadCoords,
    width: u32,
    height: u32,
    depth: u32,
    members: Vec<TriadCoords>,
}

/// Candidates for one request, plus the tolerance they are checked with.
#[derive(Debug, Clone)]
struct Plan {
    blocks: Vec<Block>,
    tolerance: u32,
}

/// A candidate that passed verification.
#[derive(Debug, Clone)]
struct Verified {
    reserved: Vec<TriadCoords>,
    dead_resources: usize,
}

fn single(root: TriadCoords) -> Block {
    Block {
        root,
        width: 1,
        height: 1,
        depth: 1,
        members: vec![root],
    }
}

fn rectangles(geometry: &MachineGeometry, width: u32, height: u32, depth: u32) -> Vec<Block> {
    let mut blocks = Vec::new();
    for y in 0..geometry.height {
        for x in 0..geometry.width {
            let fits = geometry.wraps || (x + width <= geometry.width && y + height <= geometry.height);
            if !fits {
                continue;
            }
            let root = TriadCoords::new(x, y, 0);
            if let Ok(members) = block_members(geometry, root, width, height, depth) {
                blocks.push(Block {
                    root,
                    width,
                    height,
                    depth,
                    members,
                });
            }
        }
    }
    blocks
}

fn every_board(snapshot: &HealthSnapshot) -> Vec<Block> {
    let mut roots: Vec<TriadCoords> = snapshot.boards().map(|(t, _)| *t).collect();
    roots.sort_by_key(|t| t.zyx());
    roots.into_iter().map(single).collect()
}

impl Plan {
    fn build(
        t: &Tables,
        machine_id: MachineId,
        snapshot: &HealthSnapshot,
        request: &AllocationRequest,
    ) -> Result<Self, AllocationError> {
        let geometry = snapshot.geometry;
        let resolve = |loc: &BoardLocator| {
            t.resolve_locator(machine_id, loc)
                .and_then(|id| t.boards.get(&id))
                .map(|b| b.triad)
                .ok_or_else(|| AllocationError::InvalidShape(format!("no board at {loc}")))
        };
        let tolerance = request.max_dead_boards;

        Ok(match &request.shape {
            AllocationShape::SingleBoard(None) => Plan {
                blocks: every_board(snapshot),
                tolerance: 0,
            },
            AllocationShape::SingleBoard(Some(loc)) => Plan {
                blocks: vec![single(resolve(loc)?)],
                tolerance: 0,
            },
            AllocationShape::Boards(list) => {
                let members: BTreeSet<TriadCoords> =
                    list.iter().map(resolve).collect::<Result<_, _>>()?;
                let root = members
                    .iter()
                    .copied()
                    .min_by_key(|m| m.zyx())
                    .ok_or_else(|| AllocationError::InvalidShape("empty board list".into()))?;
                let span = |f: fn(&TriadCoords) -> u32| {
                    let lo = members.iter().map(f).min().unwrap_or(0);
                    let hi = members.iter().map(f).max().unwrap_or(0);
                    hi - lo + 1
                };
                let (width, height, depth) = (span(|m| m.x), span(|m| m.y), span(|m| m.z));
                Plan {
                    blocks: vec![Block {
                        root,
                        width,
                        height,
                        depth,
                        members: members.into_iter().collect(),
                    }],
                    tolerance: 0,
                }
            }
            AllocationShape::Rectangle {
                width: 1,
                height: 1,
                depth: Some(1),
            }
            | AllocationShape::NumBoards(1) => Plan {
                blocks: every_board(snapshot),
                tolerance: 0,
            },
            AllocationShape::Rectangle { width, height, .. } => Plan {
                blocks: rectangles(&geometry, *width, *height, geometry.depth),
                tolerance,
            },
            AllocationShape::RootedRectangle {
                root,
                width,
                height,
            } => {
                let members = block_members(&geometry, *root, *width, *height, geometry.depth)
                    .map_err(|e| AllocationError::InvalidShape(e.to_string()))?;
                Plan {
                    blocks: vec![Block {
                        root: *root,
                        width: *width,
                        height: *height,
                        depth: geometry.depth,
                        members,
                    }],
                    tolerance,
                }
            }
            AllocationShape::NumBoards(n) => {
                let est = DimensionEstimate::for_boards(*n, &geometry)?;
                Plan {
                    blocks: rectangles(&geometry, est.width, est.height, est.depth),
                    tolerance: tolerance + est.tolerance,
                }
            }
        })
    }
}

/// Check one block; boards reachable from the root over live links are what
/// would be reserved.
///
/// The root must be usable even when the tolerance is above zero: it is the
/// board the job is addressed by and where the connectivity walk starts.
fn verify(snapshot: &HealthSnapshot, block: &Block, tolerance: u32) -> Result<Verified, RejectReason> {
    if !snapshot.is_usable(block.root) {
        return Err(RejectReason::RootUnusable);
    }
    let mut unusable = 0u32;
    for m in &block.members {
        if !snapshot.is_usable(*m) {
            unusable += 1;
            if unusable > tolerance {
                return Err(RejectReason::TooManyUnusable {
                    unusable,
                    tolerance,
                });
            }
        }
    }

    let geometry = &snapshot.geometry;
    let members: BTreeSet<TriadCoords> = block.members.iter().copied().collect();

    let mut dead_internal = 0usize;
    for m in &members {
        for (d, n) in neighbours(geometry, *m) {
            if members.contains(&n) && *m < n && !snapshot.link_alive(*m, d) {
                if tolerance == 0 {
                    return Err(RejectReason::DeadInternalLink { at: *m });
                }
                dead_internal += 1;
            }
        }
    }

    let mut reached = BTreeSet::from([block.root]);
    let mut queue = VecDeque::from([block.root]);
    while let Some(here) = queue.pop_front() {
        for (d, n) in neighbours(geometry, here) {
            if members.contains(&n)
                && !reached.contains(&n)
                && snapshot.is_usable(n)
                && snapshot.link_alive(here, d)
            {
                reached.insert(n);
                queue.push_back(n);
            }
        }
    }

    let required = (members.len() as u32).saturating_sub(tolerance);
    let reachable = reached.len() as u32;
    if reachable < required {
        return Err(RejectReason::Disconnected {
            reachable,
            required,
        });
    }

    let blacklisted: usize = reached
        .iter()
        .filter_map(|t| snapshot.board(*t))
        .map(|b| b.dead_resources)
        .sum();
    Ok(Verified {
        reserved: reached.into_iter().collect(),
        dead_resources: blacklisted + dead_internal + unusable as usize,
    })
}

/// Best surviving candidate, or `None`.
fn search(snapshot: &HealthSnapshot, plan: &Plan) -> Option<(Block, Verified)> {
    plan.blocks
        .iter()
        .filter_map(|block| match verify(snapshot, block, plan.tolerance) {
            Ok(v) => Some((block.clone(), v)),
            Err(reason) => {
                debug!(root = %block.root, %reason, "candidate rejected");
                None
            }
        })
        .min_by_key(|(block, v)| (v.dead_resources, block.root.zyx()))
}

// ── AllocationEngine ──────────────────────────────────────────────────────────

/// Outcome of one reservation attempt.
enum Reserve {
    Done(Allocation),
    Conflict,
}

#[derive(Debug, Clone)]
pub struct AllocationEngine {
    db: Arc<Database>,
}

impl AllocationEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Find and reserve boards for the queued job `job`.
    pub fn allocate(&self, job: JobId, now: DateTime<Utc>) -> Result<Allocation, AllocationError> {
        for attempt in 0..2 {
            let (machine_id, snapshot, plan) = self.db.read(|t| plan_for(t, job))?;
            let (block, verified) =
                search(&snapshot, &plan).ok_or(AllocationError::NoSuitableRegion { job })?;

            let outcome = self
                .db
                .transaction(|t| reserve(t, job, machine_id, &block, &verified, now))?;
            match outcome {
                Reserve::Done(allocation) => {
                    info!(
                        job,
                        machine = machine_id,
                        root = %allocation.root,
                        width = allocation.width,
                        height = allocation.height,
                        depth = allocation.depth,
                        boards = allocation.boards.len(),
                        "boards allocated"
                    );
                    return Ok(allocation);
                }
                Reserve::Conflict => {
                    warn!(job, attempt, "boards claimed during search; retrying");
                }
            }
        }
        Err(AllocationError::AllocationConflict { job })
    }

    /// Clear the owner of every board `job` holds; returns those boards.
    pub fn release(t: &mut Tables, job: JobId) -> Vec<BoardId> {
        let boards = t.boards_owned_by(job);
        for id in &boards {
            if let Some(b) = t.boards.get_mut(id) {
                b.owner = None;
            }
        }
        if !boards.is_empty() {
            debug!(job, boards = boards.len(), "boards released");
        }
        boards
    }
}

/// Snapshot and candidates for `job`, taken under one store lock.
fn plan_for(t: &Tables, job: JobId) -> Result<(MachineId, HealthSnapshot, Plan), AllocationError> {
    let record = t.jobs.get(&job).ok_or(AllocationError::NoSuitableRegion { job })?;
    if record.state != JobState::Queued {
        return Err(AllocationError::NotQueued {
            job,
            state: record.state,
        });
    }
    let request = t
        .job_requests
        .values()
        .find(|r| r.job_id == job)
        .ok_or_else(|| AllocationError::InvalidShape(format!("job {job} has no request")))?;
    let snapshot = t.health_snapshot(record.machine_id)?;
    let plan = Plan::build(t, record.machine_id, &snapshot, &request.request)?;
    Ok((record.machine_id, snapshot, plan))
}

fn reserve(
    t: &mut Tables,
    job: JobId,
    machine_id: MachineId,
    block: &Block,
    verified: &Verified,
    now: DateTime<Utc>,
) -> Result<Reserve, AllocationError> {
    let state = t
        .jobs
        .get(&job)
        .map(|j| j.state)
        .ok_or(AllocationError::NoSuitableRegion { job })?;
    if state != JobState::Queued {
        return Err(AllocationError::NotQueued { job, state });
    }

    let mut boards = Vec::with_capacity(verified.reserved.len());
    for triad in &verified.reserved {
        let Some(board) = t.board_at(machine_id, *triad) else {
            return Ok(Reserve::Conflict);
        };
        let id = board.id;
        if !board_usable(t, id)? {
            return Ok(Reserve::Conflict);
        }
        boards.push((id, *triad));
    }

    let root_id = t.board_at(machine_id, block.root).map(|b| b.id);
    for (id, _) in &boards {
        t.board_mut(*id)?.owner = Some(job);
    }
    if let Some(record) = t.jobs.get_mut(&job) {
        record.state = JobState::Allocated;
        record.root_id = root_id;
        record.width = Some(block.width);
        record.height = Some(block.height);
        record.depth = Some(block.depth);
        record.allocation_size = Some(boards.len() as u32);
        record.allocation_timestamp = Some(now);
    }
    t.job_requests.retain(|_, r| r.job_id != job);

    Ok(Reserve::Done(Allocation {
        machine_id,
        root: block.root,
        width: block.width,
        height: block.height,
        depth: block.depth,
        boards,
    }))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
