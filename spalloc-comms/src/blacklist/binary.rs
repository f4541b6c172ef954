/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Binary blacklist layout, as stored in board serial flash.
//!
//! ```text
//! word 0      entry count N (≤ 48)
//! word 1..=N  ┌──────┬────────────┬──────────┬──────────────────┐
//!             │31  30│29        24│23      18│17               0│
//!             │ dead │ (x<<3) | y │ link mask│ core mask        │
//!             └──────┴────────────┴──────────┴──────────────────┘
//! ```
//!
//! All words are little-endian.  The encoder writes a dead chip as a full
//! core mask (`0x3FFFF`), which is what the firmware understands; the decoder
//! additionally accepts bit 31 as a dead flag.  Entries are emitted in
//! x-major, y-ascending order and only for chips with something dead.

use byteorder::{ByteOrder, LittleEndian};

use super::{Blacklist, BlacklistError};
use crate::geometry::{
    ChipLocation, Direction, CHIPS_PER_BOARD, MAX_LINKS_PER_ROUTER, MAX_NUM_CORES,
};

const WORD_SIZE: usize = 4;

/// Bit position of the link mask.
const LINK_SHIFT: u32 = MAX_NUM_CORES;

/// Bit position of the packed chip coordinates.
const COORD_SHIFT: u32 = MAX_NUM_CORES + MAX_LINKS_PER_ROUTER;

/// Bits per chip coordinate inside the packed field.
const COORD_BITS: u32 = 3;

const CORE_MASK: u32 = (1 << MAX_NUM_CORES) - 1;
const LINK_MASK: u32 = (1 << MAX_LINKS_PER_ROUTER) - 1;
const COORD_MASK: u32 = (1 << (2 * COORD_BITS)) - 1;
const DEAD_FLAG: u32 = 1 << 31;

/// Largest encoded blacklist, in bytes.
pub const MAX_ENCODED_SIZE: usize = (CHIPS_PER_BOARD + 1) * WORD_SIZE;

impl Blacklist {
    /// Encode to the firmware layout.
    pub fn encode(&self) -> Vec<u8> {
        let entries: Vec<u32> = crate::geometry::board_chips()
            .filter_map(|chip| self.entry_word(chip))
            .collect();

        let mut buf = vec![0u8; (entries.len() + 1) * WORD_SIZE];
        LittleEndian::write_u32(&mut buf[..WORD_SIZE], entries.len() as u32);
        for (slot, word) in buf[WORD_SIZE..].chunks_exact_mut(WORD_SIZE).zip(&entries) {
            LittleEndian::write_u32(slot, *word);
        }
        buf
    }

    /// Decode from the firmware layout.  Bytes after the last declared entry
    /// are ignored (flash pages are read whole).
    pub fn decode(data: &[u8]) -> Result<Self, BlacklistError> {
        if data.len() < WORD_SIZE {
            return Err(BlacklistError::Truncated {
                needed: WORD_SIZE,
                available: data.len(),
            });
        }
        let count = LittleEndian::read_u32(&data[..WORD_SIZE]);
        if count as usize > CHIPS_PER_BOARD {
            return Err(BlacklistError::TooManyEntries { count });
        }
        let needed = (count as usize + 1) * WORD_SIZE;
        if data.len() < needed {
            return Err(BlacklistError::Truncated {
                needed,
                available: data.len(),
            });
        }

        let mut bl = Blacklist::new();
        for raw in data[WORD_SIZE..needed].chunks_exact(WORD_SIZE) {
            let word = LittleEndian::read_u32(raw);
            let coord = (word >> COORD_SHIFT) & COORD_MASK;
            let chip = ChipLocation::new(coord >> COORD_BITS, coord & ((1 << COORD_BITS) - 1));
            if !chip.is_on_board() {
                return Err(BlacklistError::InvalidEntry { word });
            }

            let cores = word & CORE_MASK;
            if word & DEAD_FLAG != 0 || cores == CORE_MASK {
                bl.add_dead_chip(chip);
                continue;
            }
            bl.add_dead_cores(chip, (0..MAX_NUM_CORES).filter(|&c| cores & (1u32 << c) != 0));
            let links = (word >> LINK_SHIFT) & LINK_MASK;
            bl.add_dead_links(
                chip,
                Direction::ALL
                    .into_iter()
                    .filter(|d| links & (1 << d.id()) != 0),
            );
        }
        Ok(bl)
    }

    /// The packed entry for `chip`, or `None` when nothing on it is dead.
    fn entry_word(&self, chip: ChipLocation) -> Option<u32> {
        let value = if self.is_chip_dead(chip) {
            CORE_MASK
        } else {
            let cores = self
                .dead_cores()
                .get(&chip)
                .map_or(0, |set| set.iter().fold(0u32, |m, &c| m | (1u32 << c)));
            let links = self
                .dead_links()
                .get(&chip)
                .map_or(0, |set| set.iter().fold(0u32, |m, d| m | (1u32 << d.id())));
            cores | (links << LINK_SHIFT)
        };
        if value == 0 {
            return None;
        }
        let coord = (chip.x << COORD_BITS) | chip.y;
        Some((coord << COORD_SHIFT) | value)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
