/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The BMP transceiver abstraction.
//!
//! [`BmpTransceiver`] is the single seam between the allocator and board
//! hardware.  Two implementations exist:
//!
//! * [`udp::UdpBmpTransceiver`] – real BMPs over SCP/UDP, with per-packet
//!   retries.
//! * [`mock::MockBmpTransceiver`] – in-memory boards for tests and dry runs.
//!
//! Whatever constructs the BMP controller receives the transceiver as an
//! `Arc<dyn BmpTransceiver>`; there is no process-wide instance.

pub mod mock;
pub mod udp;

use std::fmt;

use async_trait::async_trait;

use crate::blacklist::Blacklist;
use crate::error::CommsError;
use crate::geometry::Direction;

// ── Addressing ────────────────────────────────────────────────────────────────

/// A BMP is addressed by the cabinet and frame it manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BmpCoords {
    pub cabinet: u32,
    pub frame: u32,
}

impl BmpCoords {
    pub const fn new(cabinet: u32, frame: u32) -> Self {
        Self { cabinet, frame }
    }
}

impl fmt::Display for BmpCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[c:{},f:{}]", self.cabinet, self.frame)
    }
}

/// A board slot within a frame, as numbered by its BMP (`0..24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BmpBoard(pub u32);

impl fmt::Display for BmpBoard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "board {}", self.0)
    }
}

/// Board bitmask as used by the power command.
pub fn board_mask(boards: &[BmpBoard]) -> u32 {
    boards.iter().fold(0u32, |mask, b| mask | (1u32 << b.0))
}

// ── Commands and replies ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PowerCommand {
    On,
    Off,
}

impl fmt::Display for PowerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PowerCommand::On => "on",
            PowerCommand::Off => "off",
        })
    }
}

/// Firmware version reported by a BMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmpVersion {
    pub major: u32,
    pub minor: u32,
    pub name: String,
}

impl BmpVersion {
    /// Oldest firmware that can manage FPGA registers.
    pub const FPGA_MANAGEMENT_MIN_MAJOR: u32 = 2;

    pub fn can_manage_fpgas(&self) -> bool {
        self.major >= Self::FPGA_MANAGEMENT_MIN_MAJOR
    }
}

// ── FPGA registers ────────────────────────────────────────────────────────────

/// Number of link FPGAs on a SpiNN-5 board.
pub const FPGA_COUNT: u32 = 3;

/// Pseudo-FPGA id addressing all three at once; an FPGA reporting this id in
/// its FLAG register has lost its bitfile.
pub const FPGA_ALL: u32 = 3;

/// Main FLAG register; the bottom two bits hold the FPGA's own id.
pub const FPGA_FLAG_REGISTER: u32 = 0x0004_0004;

pub const FPGA_FLAG_ID_MASK: u32 = 0x3;

/// Link STOP register within a link bank; writing 1 disables the link.
const FPGA_STOP_REGISTER: u32 = 0x0000_005C;

/// Distance between the two link banks of an FPGA.
const FPGA_BANK_STRIDE: u32 = 0x0001_0000;

/// The `(fpga, register address)` controlling the board-edge link in
/// `direction`.
pub fn link_stop_register(direction: Direction) -> (u32, u32) {
    let (fpga, bank) = match direction {
        Direction::East => (0, 0),
        Direction::South => (0, 1),
        Direction::SouthWest => (1, 0),
        Direction::West => (1, 1),
        Direction::North => (2, 0),
        Direction::NorthEast => (2, 1),
    };
    (fpga, FPGA_STOP_REGISTER + bank * FPGA_BANK_STRIDE)
}

// ── Trait ─────────────────────────────────────────────────────────────────────

/// Operations a BMP can carry out for the boards it manages.
///
/// Implementations must be idempotent with respect to state: repeating a
/// power command or a blacklist write leaves the board exactly as one call
/// would, because retries can duplicate delivered-but-unacknowledged
/// requests.
#[async_trait]
pub trait BmpTransceiver: Send + Sync {
    /// Switch `boards` of one frame on or off in a single request.
    async fn power(
        &self,
        bmp: BmpCoords,
        boards: &[BmpBoard],
        command: PowerCommand,
    ) -> Result<(), CommsError>;

    async fn read_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
    ) -> Result<u32, CommsError>;

    async fn write_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
        value: u32,
    ) -> Result<(), CommsError>;

    async fn read_bmp_version(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<BmpVersion, CommsError>;

    /// The board's serial number, as reported by the BMP.
    async fn read_serial(&self, bmp: BmpCoords, board: BmpBoard) -> Result<String, CommsError>;

    /// The blacklist held in the board's serial flash.
    async fn read_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<Blacklist, CommsError>;

    /// Replace the blacklist held in the board's serial flash.
    async fn write_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        blacklist: &Blacklist,
    ) -> Result<(), CommsError>;

    /// Read BMP memory.
    async fn read_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, CommsError>;

    /// Write BMP memory.
    async fn write_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        data: &[u8],
    ) -> Result<(), CommsError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
