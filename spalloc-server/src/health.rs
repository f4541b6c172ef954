/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Board health registry.
//!
//! Liveness, blacklists and dead links as the allocator sees them.  The
//! allocator never queries live state while searching; it takes a
//! [`HealthSnapshot`] under one store lock and works from that, so a board
//! dying mid-search is only noticed when the reservation re-checks.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use spalloc_comms::geometry::CHIPS_PER_BOARD;
use spalloc_comms::{Blacklist, Direction};
use tracing::{info, warn};

use crate::db::{BlacklistStore, BoardId, Database, DbError, JobId, MachineId, Tables};
use crate::topology::{neighbours, MachineGeometry, TriadCoords};

// ── Table-level predicates ────────────────────────────────────────────────────

/// Count of blacklist rows per board.
fn dead_resource_counts(t: &Tables) -> BTreeMap<BoardId, (usize, usize)> {
    let mut counts: BTreeMap<BoardId, (usize, usize)> = BTreeMap::new();
    for (b, _) in &t.blacklisted_chips {
        let e = counts.entry(*b).or_default();
        e.0 += 1;
        e.1 += 1;
    }
    for (b, ..) in &t.blacklisted_cores {
        counts.entry(*b).or_default().1 += 1;
    }
    for (b, ..) in &t.blacklisted_links {
        counts.entry(*b).or_default().1 += 1;
    }
    counts
}

fn fully_blacklisted(t: &Tables, board: BoardId) -> bool {
    t.blacklisted_chips.iter().filter(|(b, _)| *b == board).count() >= CHIPS_PER_BOARD
}

/// Alive, not fully blacklisted and unowned.
pub fn board_usable(t: &Tables, board: BoardId) -> Result<bool, DbError> {
    let record = t.board(board)?;
    Ok(record.functioning && record.owner.is_none() && !fully_blacklisted(t, board))
}

/// No dead link recorded at either end, and both boards present and alive.
pub fn link_usable(t: &Tables, board: BoardId, direction: Direction) -> Result<bool, DbError> {
    let record = t.board(board)?;
    if !record.functioning || t.board_links.contains(&(board, direction)) {
        return Ok(false);
    }
    let Some(machine) = t.machines.get(&record.machine_id) else {
        return Err(DbError::NoSuchMachine(record.machine_id.to_string()));
    };
    let far = neighbours(machine.geometry(), record.triad)
        .into_iter()
        .find(|(d, _)| *d == direction)
        .and_then(|(_, triad)| t.board_at(machine.id, triad));
    Ok(match far {
        Some(other) => {
            other.functioning && !t.board_links.contains(&(other.id, direction.opposite()))
        }
        None => false,
    })
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardHealth {
    pub board_id: BoardId,
    pub usable: bool,
    pub alive: bool,
    pub owner: Option<JobId>,
    /// Dead chips + dead cores + dead chip links.
    pub dead_resources: usize,
    /// Dead board-edge links, from either end.
    pub dead_links: BTreeSet<Direction>,
}

/// Immutable view of one machine's health.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub machine_id: MachineId,
    pub geometry: MachineGeometry,
    boards: BTreeMap<TriadCoords, BoardHealth>,
}

impl HealthSnapshot {
    pub fn board(&self, triad: TriadCoords) -> Option<&BoardHealth> {
        self.boards.get(&triad)
    }

    pub fn boards(&self) -> impl Iterator<Item = (&TriadCoords, &BoardHealth)> {
        self.boards.iter()
    }

    pub fn is_usable(&self, triad: TriadCoords) -> bool {
        self.boards.get(&triad).is_some_and(|b| b.usable)
    }

    /// Whether the link leaving `triad` towards `direction` carries traffic.
    pub fn link_alive(&self, triad: TriadCoords, direction: Direction) -> bool {
        let Some(here) = self.boards.get(&triad) else {
            return false;
        };
        if !here.alive || here.dead_links.contains(&direction) {
            return false;
        }
        neighbours(&self.geometry, triad)
            .into_iter()
            .find(|(d, _)| *d == direction)
            .and_then(|(_, t)| self.boards.get(&t))
            .is_some_and(|there| there.alive)
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }
}

impl Tables {
    pub fn health_snapshot(&self, machine_id: MachineId) -> Result<HealthSnapshot, DbError> {
        let machine = self
            .machines
            .get(&machine_id)
            .ok_or_else(|| DbError::NoSuchMachine(machine_id.to_string()))?;
        let geometry = *machine.geometry();
        let counts = dead_resource_counts(self);

        let mut boards: BTreeMap<TriadCoords, BoardHealth> = self
            .boards_of(machine_id)
            .map(|b| {
                let (dead_chips, dead_resources) = counts.get(&b.id).copied().unwrap_or_default();
                let health = BoardHealth {
                    board_id: b.id,
                    usable: b.functioning && b.owner.is_none() && dead_chips < CHIPS_PER_BOARD,
                    alive: b.functioning,
                    owner: b.owner,
                    dead_resources,
                    dead_links: BTreeSet::new(),
                };
                (b.triad, health)
            })
            .collect();

        // Each declared dead link is dead from both ends.
        for (board, direction) in &self.board_links {
            let Ok(record) = self.board(*board) else { continue };
            if record.machine_id != machine_id {
                continue;
            }
            if let Some(h) = boards.get_mut(&record.triad) {
                h.dead_links.insert(*direction);
            }
            let far = neighbours(&geometry, record.triad)
                .into_iter()
                .find(|(d, _)| d == direction);
            if let Some((_, triad)) = far {
                if let Some(h) = boards.get_mut(&triad) {
                    h.dead_links.insert(direction.opposite());
                }
            }
        }

        Ok(HealthSnapshot {
            machine_id,
            geometry,
            boards,
        })
    }
}

// ── HealthRegistry ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HealthRegistry {
    db: Arc<Database>,
    blacklists: BlacklistStore,
}

impl HealthRegistry {
    pub fn new(db: Arc<Database>) -> Self {
        let blacklists = BlacklistStore::new(Arc::clone(&db));
        Self { db, blacklists }
    }

    pub fn is_board_usable(&self, board: BoardId) -> Result<bool, DbError> {
        self.db.read(|t| board_usable(t, board))
    }

    pub fn link_usable(&self, board: BoardId, direction: Direction) -> Result<bool, DbError> {
        self.db.read(|t| link_usable(t, board, direction))
    }

    pub fn mark_dead(&self, board: BoardId) -> Result<(), DbError> {
        self.db.transaction(|t| {
            t.board_mut(board)?.functioning = false;
            Ok::<_, DbError>(())
        })?;
        warn!(board, "board marked dead");
        Ok(())
    }

    /// Bring a board back into service; also clears `needs_check`.
    pub fn mark_alive(&self, board: BoardId) -> Result<(), DbError> {
        self.db.transaction(|t| {
            let b = t.board_mut(board)?;
            b.functioning = true;
            b.needs_check = false;
            Ok::<_, DbError>(())
        })?;
        info!(board, "board marked alive");
        Ok(())
    }

    pub fn apply_blacklist(
        &self,
        board: BoardId,
        blacklist: &Blacklist,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.blacklists.write_blacklist(board, blacklist, now)
    }

    pub fn blacklists(&self) -> &BlacklistStore {
        &self.blacklists
    }

    pub fn snapshot(&self, machine: MachineId) -> Result<HealthSnapshot, DbError> {
        self.db.read(|t| t.health_snapshot(machine))
    }

    pub fn mark_needs_check(&self, boards: &[BoardId]) -> Result<(), DbError> {
        self.db.transaction(|t| {
            for b in boards {
                t.board_mut(*b)?.needs_check = true;
            }
            Ok::<_, DbError>(())
        })?;
        if !boards.is_empty() {
            warn!(?boards, "boards flagged for re-check");
        }
        Ok(())
    }

    pub fn boards_needing_check(&self, machine: MachineId) -> Vec<BoardId> {
        self.db.read(|t| {
            t.boards_of(machine)
                .filter(|b| b.needs_check)
                .map(|b| b.id)
                .collect()
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
