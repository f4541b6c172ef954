/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Chip coordinates and link directions of a SpiNN-5 board.
//!
//! A SpiNN-5 board carries 48 chips laid out as a hexagon inside an 8×8
//! grid.  Three boards tile a 12×12 chip *triad*; the board whose root chip
//! sits at the triad origin owns exactly the chips listed in
//! [`BOARD_COLUMNS`].

use std::fmt;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Cores per chip (application + monitor).
pub const MAX_NUM_CORES: u32 = 18;

/// Inter-chip links per router.
pub const MAX_LINKS_PER_ROUTER: u32 = 6;

/// Chips on one SpiNN-5 board.
pub const CHIPS_PER_BOARD: usize = 48;

/// Width (and height) of the bounding box of one board, in chips.
pub const BOARD_SIZE: u32 = 8;

/// Width (and height) of one triad of three boards, in chips.
pub const TRIAD_CHIP_SIZE: u32 = 12;

/// Inclusive `y` range present in each column `x` of a SpiNN-5 board.
pub const BOARD_COLUMNS: [(u32, u32); BOARD_SIZE as usize] = [
    (0, 3),
    (0, 4),
    (0, 5),
    (0, 6),
    (0, 7),
    (1, 7),
    (2, 7),
    (3, 7),
];

// ── ChipLocation ──────────────────────────────────────────────────────────────

/// The `(x, y)` coordinates of a chip, either board-local or machine-global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ChipLocation {
    pub x: u32,
    pub y: u32,
}

impl ChipLocation {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// `true` if this board-local location is one of the 48 chips of a
    /// SpiNN-5 board.
    pub fn is_on_board(self) -> bool {
        match BOARD_COLUMNS.get(self.x as usize) {
            Some(&(lo, hi)) => self.y >= lo && self.y <= hi,
            None => false,
        }
    }
}

impl fmt::Display for ChipLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// All chips of a SpiNN-5 board, x-major then y-ascending.
pub fn board_chips() -> impl Iterator<Item = ChipLocation> {
    BOARD_COLUMNS
        .iter()
        .enumerate()
        .flat_map(|(x, &(lo, hi))| (lo..=hi).map(move |y| ChipLocation::new(x as u32, y)))
}

// ── Direction ─────────────────────────────────────────────────────────────────

/// One of the six hexagonal link directions.
///
/// The numeric ids are the router link numbers used by the firmware and by
/// the blacklist formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Direction {
    East,
    NorthEast,
    North,
    West,
    SouthWest,
    South,
}

impl Direction {
    /// All directions in id order.
    pub const ALL: [Direction; 6] = [
        Direction::East,
        Direction::NorthEast,
        Direction::North,
        Direction::West,
        Direction::SouthWest,
        Direction::South,
    ];

    /// Router link number (`0..=5`).
    pub fn id(self) -> u32 {
        match self {
            Direction::East => 0,
            Direction::NorthEast => 1,
            Direction::North => 2,
            Direction::West => 3,
            Direction::SouthWest => 4,
            Direction::South => 5,
        }
    }

    /// Inverse of [`id`](Self::id); `None` outside `0..=5`.
    pub fn from_id(id: u32) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    /// The direction a link arrives from at its far end.
    pub fn opposite(self) -> Self {
        Self::ALL[((self.id() + 3) % MAX_LINKS_PER_ROUTER) as usize]
    }

    /// Name as used in machine definition files.
    pub fn name(self) -> &'static str {
        match self {
            Direction::East => "east",
            Direction::NorthEast => "northEast",
            Direction::North => "north",
            Direction::West => "west",
            Direction::SouthWest => "southWest",
            Direction::South => "south",
        }
    }

    /// Parse a machine-definition direction name.
    ///
    /// Accepts the camel-case names produced by [`name`](Self::name) as well
    /// as `snake_case` and `kebab-case` spellings.
    pub fn from_name(name: &str) -> Option<Self> {
        let folded: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.name().to_ascii_lowercase() == folded)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn board_has_48_chips() {
        assert_eq!(board_chips().count(), CHIPS_PER_BOARD);
        assert!(board_chips().all(ChipLocation::is_on_board));
    }

    #[test]
    fn board_corners_follow_hexagon() {
        assert!(ChipLocation::new(0, 0).is_on_board());
        assert!(ChipLocation::new(0, 3).is_on_board());
        assert!(!ChipLocation::new(0, 7).is_on_board());
        assert!(!ChipLocation::new(7, 0).is_on_board());
        assert!(ChipLocation::new(7, 7).is_on_board());
        assert!(ChipLocation::new(4, 0).is_on_board());
        assert!(!ChipLocation::new(8, 4).is_on_board());
    }

    #[test]
    fn board_chips_are_x_major() {
        let chips: Vec<_> = board_chips().take(6).collect();
        assert_eq!(chips[0], ChipLocation::new(0, 0));
        assert_eq!(chips[3], ChipLocation::new(0, 3));
        assert_eq!(chips[4], ChipLocation::new(1, 0));
        assert_eq!(chips[5], ChipLocation::new(1, 1));
    }

    #[test]
    fn direction_ids_round_trip() {
        for d in Direction::ALL {
            assert_eq!(Direction::from_id(d.id()), Some(d));
        }
        assert_eq!(Direction::from_id(6), None);
        assert_eq!(Direction::from_id(3), Some(Direction::West));
    }

    #[test]
    fn opposite_is_an_involution() {
        assert_eq!(Direction::East.opposite(), Direction::West);
        assert_eq!(Direction::NorthEast.opposite(), Direction::SouthWest);
        assert_eq!(Direction::South.opposite(), Direction::North);
        for d in Direction::ALL {
            assert_eq!(d.opposite().opposite(), d);
        }
    }

    #[test]
    fn direction_names_accept_several_spellings() {
        assert_eq!(Direction::from_name("northEast"), Some(Direction::NorthEast));
        assert_eq!(Direction::from_name("north_east"), Some(Direction::NorthEast));
        assert_eq!(Direction::from_name("south-west"), Some(Direction::SouthWest));
        assert_eq!(Direction::from_name("up"), None);
    }
}
