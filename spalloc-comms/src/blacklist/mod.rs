/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Board blacklists: the known-bad chips, cores and links of one board.
//!
//! A [`Blacklist`] has two external representations:
//!
//! | Format | Module | Used by |
//! |---|---|---|
//! | line-oriented text (`chip 0 0 core 2 link 3`) | [`text`] | administrators, blacklist files |
//! | little-endian 32-bit words | [`binary`] | BMP serial flash / board firmware |
//!
//! Both round-trip losslessly through [`Blacklist`].  The model keeps itself
//! normalised on every mutation: a chip with every core dead becomes a dead
//! chip, and a dead chip never carries core or link entries.  Chips that are
//! not on the board and core numbers past the last core are never stored, so
//! every model value has an encoding.

pub mod binary;
pub mod text;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::geometry::{ChipLocation, Direction, CHIPS_PER_BOARD, MAX_NUM_CORES};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Failure to parse or decode a blacklist.
///
/// The text-format variants carry the offending line verbatim so that tools
/// which key on the message text keep working.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlacklistError {
    /// The line does not match the grammar (leading/trailing garbage,
    /// repeated clause, unparseable number).
    #[error("bad line: {0}")]
    BadLine(String),

    /// The chip is not one of the 48 chips of a board.
    #[error("bad chip coords: {0}")]
    BadChipCoords(String),

    /// A core index outside `0..=17`.
    #[error("bad core number: {0}")]
    BadCoreNumber(String),

    /// A link index outside `0..=5`.
    ///
    /// Kept separate from [`BadLine`](Self::BadLine): callers have always
    /// seen a bounds failure here rather than a grammar failure.
    #[error("link index {index} out of bounds for length 6: {line}")]
    LinkIndexOutOfRange { line: String, index: u32 },

    /// The binary data ended before the declared number of entries.
    #[error("blacklist data truncated: need {needed} bytes but only {available} present")]
    Truncated { needed: usize, available: usize },

    /// The binary header declares more entries than a board has chips.
    #[error("blacklist declares {count} entries (at most {CHIPS_PER_BOARD} allowed)")]
    TooManyEntries { count: u32 },

    /// A binary entry names a chip that is not on the board.
    #[error("blacklist entry {word:#010x} names a chip that is not on the board")]
    InvalidEntry { word: u32 },
}

// ── Blacklist ─────────────────────────────────────────────────────────────────

/// Dead resources of a single board, in board-local chip coordinates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Blacklist {
    chips: BTreeSet<ChipLocation>,
    cores: BTreeMap<ChipLocation, BTreeSet<u32>>,
    links: BTreeMap<ChipLocation, BTreeSet<Direction>>,
}

impl Blacklist {
    /// An empty blacklist (nothing dead).
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when no chip, core or link is blacklisted.
    pub fn is_empty(&self) -> bool {
        self.chips.is_empty() && self.cores.is_empty() && self.links.is_empty()
    }

    /// Fully dead chips.
    pub fn dead_chips(&self) -> &BTreeSet<ChipLocation> {
        &self.chips
    }

    /// Dead cores of chips that are otherwise alive.
    pub fn dead_cores(&self) -> &BTreeMap<ChipLocation, BTreeSet<u32>> {
        &self.cores
    }

    /// Dead links of chips that are otherwise alive.
    pub fn dead_links(&self) -> &BTreeMap<ChipLocation, BTreeSet<Direction>> {
        &self.links
    }

    pub fn is_chip_dead(&self, chip: ChipLocation) -> bool {
        self.chips.contains(&chip)
    }

    /// `true` when every chip of the board is dead.
    pub fn is_board_dead(&self) -> bool {
        self.chips.len() >= CHIPS_PER_BOARD
    }

    /// Count of individual dead resources, used to rank otherwise equal
    /// allocations.
    pub fn dead_resource_count(&self) -> usize {
        self.chips.len()
            + self.cores.values().map(BTreeSet::len).sum::<usize>()
            + self.links.values().map(BTreeSet::len).sum::<usize>()
    }

    /// Mark a whole chip dead, dropping any core/link entries it had.
    /// Ignored for a chip that is not on the board.
    pub fn add_dead_chip(&mut self, chip: ChipLocation) {
        if !chip.is_on_board() {
            return;
        }
        self.cores.remove(&chip);
        self.links.remove(&chip);
        self.chips.insert(chip);
    }

    /// Mark cores of a chip dead.  Ignored if the chip is already dead or not
    /// on the board; core numbers from `MAX_NUM_CORES` up are dropped.
    pub fn add_dead_cores(&mut self, chip: ChipLocation, cores: impl IntoIterator<Item = u32>) {
        if self.chips.contains(&chip) || !chip.is_on_board() {
            return;
        }
        let set = self.cores.entry(chip).or_default();
        set.extend(cores.into_iter().filter(|&c| c < MAX_NUM_CORES));
        if set.is_empty() {
            self.cores.remove(&chip);
        } else if set.len() >= MAX_NUM_CORES as usize {
            self.add_dead_chip(chip);
        }
    }

    /// Mark links of a chip dead.  Ignored if the chip is already dead or not
    /// on the board.
    pub fn add_dead_links(
        &mut self,
        chip: ChipLocation,
        links: impl IntoIterator<Item = Direction>,
    ) {
        if self.chips.contains(&chip) || !chip.is_on_board() {
            return;
        }
        let set = self.links.entry(chip).or_default();
        set.extend(links);
        if set.is_empty() {
            self.links.remove(&chip);
        }
    }

    /// Every chip mentioned by the blacklist, in x-major order.
    pub fn chips(&self) -> BTreeSet<ChipLocation> {
        self.chips
            .iter()
            .chain(self.cores.keys())
            .chain(self.links.keys())
            .copied()
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
