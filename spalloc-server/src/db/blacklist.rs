/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Blacklist persistence.
//!
//! A board's blacklist lives in three row sets (`blacklisted_chips`,
//! `blacklisted_cores`, `blacklisted_links`).  Writing replaces every row for
//! the board in one transaction, so readers never see a half-written
//! blacklist.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use spalloc_comms::Blacklist;
use tracing::debug;

use super::{BoardId, Database, DbError, Tables};

impl Tables {
    /// `None` when the board has no blacklist rows at all.
    pub fn read_blacklist(&self, board: BoardId) -> Result<Option<Blacklist>, DbError> {
        self.board(board)?;
        let mut blacklist = Blacklist::new();
        for (_, chip) in self.blacklisted_chips.iter().filter(|(b, _)| *b == board) {
            blacklist.add_dead_chip(*chip);
        }
        for (_, chip, core) in self.blacklisted_cores.iter().filter(|(b, ..)| *b == board) {
            blacklist.add_dead_cores(*chip, [*core]);
        }
        for (_, chip, link) in self.blacklisted_links.iter().filter(|(b, ..)| *b == board) {
            blacklist.add_dead_links(*chip, [*link]);
        }
        let has_rows = self.blacklisted_chips.iter().any(|(b, _)| *b == board)
            || self.blacklisted_cores.iter().any(|(b, ..)| *b == board)
            || self.blacklisted_links.iter().any(|(b, ..)| *b == board);
        Ok(has_rows.then_some(blacklist))
    }

    /// Replace every blacklist row of `board` and stamp `blacklist_set`.
    pub fn write_blacklist(
        &mut self,
        board: BoardId,
        blacklist: &Blacklist,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.board_mut(board)?.blacklist_set = Some(now);

        self.blacklisted_chips.retain(|(b, _)| *b != board);
        self.blacklisted_cores.retain(|(b, ..)| *b != board);
        self.blacklisted_links.retain(|(b, ..)| *b != board);

        for chip in blacklist.dead_chips() {
            self.blacklisted_chips.insert((board, *chip));
        }
        for (chip, cores) in blacklist.dead_cores() {
            for core in cores {
                self.blacklisted_cores.insert((board, *chip, *core));
            }
        }
        for (chip, links) in blacklist.dead_links() {
            for link in links {
                self.blacklisted_links.insert((board, *chip, *link));
            }
        }
        debug!(
            board,
            dead_resources = blacklist.dead_resource_count(),
            "blacklist stored"
        );
        Ok(())
    }
}

/// Shared handle for components that only touch blacklists.
#[derive(Debug, Clone)]
pub struct BlacklistStore {
    db: Arc<Database>,
}

impl BlacklistStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn read_blacklist(&self, board: BoardId) -> Result<Option<Blacklist>, DbError> {
        self.db.read(|t| t.read_blacklist(board))
    }

    pub fn write_blacklist(
        &self,
        board: BoardId,
        blacklist: &Blacklist,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        self.db.transaction(|t| t.write_blacklist(board, blacklist, now))
    }

    /// Record that the board's on-flash copy now matches the stored one.
    pub fn mark_synced(&self, board: BoardId, now: DateTime<Utc>) -> Result<(), DbError> {
        self.db.transaction(|t| {
            t.board_mut(board)?.blacklist_sync = Some(now);
            Ok(())
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
