/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! In-memory [`BmpTransceiver`] for tests and `--dry-run`.
//!
//! Boards start powered off with an empty blacklist, firmware 2.2 and FPGAs
//! that report their own id.  Every call is logged as a [`MockCall`] so tests
//! can assert on ordering; failures can be injected per BMP or per board.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{
    link_stop_register, BmpBoard, BmpCoords, BmpTransceiver, BmpVersion, PowerCommand,
    FPGA_FLAG_REGISTER,
};
use crate::blacklist::Blacklist;
use crate::error::CommsError;
use crate::geometry::Direction;
use crate::scp::{ResultCode, ScpCommand};

/// Attempts reported by an injected [`MockFailure::Unreachable`].
const MOCK_ATTEMPTS: u32 = 3;

/// One recorded transceiver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Power {
        bmp: BmpCoords,
        boards: Vec<BmpBoard>,
        command: PowerCommand,
    },
    ReadFpga {
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
    },
    WriteFpga {
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
        value: u32,
    },
    ReadVersion(BmpCoords, BmpBoard),
    ReadSerial(BmpCoords, BmpBoard),
    ReadBlacklist(BmpCoords, BmpBoard),
    WriteBlacklist(BmpCoords, BmpBoard),
    ReadMemory(BmpCoords, BmpBoard, u32),
    WriteMemory(BmpCoords, BmpBoard, u32),
}

/// How an injected failure presents itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Nothing answers; surfaces as an exhausted retry budget.
    Unreachable,
    /// The BMP answers with this result code.
    Rejected(ResultCode),
}

type BoardKey = (BmpCoords, BmpBoard);

#[derive(Default)]
struct MockState {
    powered: BTreeMap<BoardKey, bool>,
    calls: Vec<MockCall>,
    blacklists: HashMap<BoardKey, Blacklist>,
    serials: HashMap<BoardKey, String>,
    registers: HashMap<(BoardKey, u32, u32), u32>,
    memory: HashMap<(BoardKey, u32), u8>,
    bmp_failures: HashMap<BmpCoords, MockFailure>,
    board_failures: HashMap<BoardKey, MockFailure>,
    version: Option<BmpVersion>,
    delay: Option<Duration>,
}

#[derive(Default)]
pub struct MockBmpTransceiver {
    state: Mutex<MockState>,
}

impl MockBmpTransceiver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Inspection ────────────────────────────────────────────────────────────

    pub fn is_powered(&self, bmp: BmpCoords, board: BmpBoard) -> bool {
        self.state().powered.get(&(bmp, board)).copied().unwrap_or(false)
    }

    /// Every board currently switched on.
    pub fn powered_boards(&self) -> BTreeSet<BoardKey> {
        self.state()
            .powered
            .iter()
            .filter(|(_, on)| **on)
            .map(|(key, _)| *key)
            .collect()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Just the power calls, in issue order.
    pub fn power_calls(&self) -> Vec<(BmpCoords, Vec<BmpBoard>, PowerCommand)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                MockCall::Power {
                    bmp,
                    boards,
                    command,
                } => Some((*bmp, boards.clone(), *command)),
                _ => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn stored_blacklist(&self, bmp: BmpCoords, board: BmpBoard) -> Option<Blacklist> {
        self.state().blacklists.get(&(bmp, board)).cloned()
    }

    /// `true` if the link leaving `board` towards `direction` has been stopped.
    pub fn link_stopped(&self, bmp: BmpCoords, board: BmpBoard, direction: Direction) -> bool {
        let (fpga, address) = link_stop_register(direction);
        self.state()
            .registers
            .get(&((bmp, board), fpga, address))
            .is_some_and(|v| *v != 0)
    }

    // ── Setup ─────────────────────────────────────────────────────────────────

    pub fn set_blacklist(&self, bmp: BmpCoords, board: BmpBoard, blacklist: Blacklist) {
        self.state().blacklists.insert((bmp, board), blacklist);
    }

    pub fn set_serial(&self, bmp: BmpCoords, board: BmpBoard, serial: impl Into<String>) {
        self.state().serials.insert((bmp, board), serial.into());
    }

    /// Override what an FPGA reports in its FLAG register.
    pub fn set_fpga_flag(&self, bmp: BmpCoords, board: BmpBoard, fpga: u32, flag: u32) {
        self.state()
            .registers
            .insert(((bmp, board), fpga, FPGA_FLAG_REGISTER), flag);
    }

    pub fn set_version(&self, version: BmpVersion) {
        self.state().version = Some(version);
    }

    /// Make every call sleep first, so tests can overlap operations.
    pub fn set_delay(&self, delay: Duration) {
        self.state().delay = Some(delay);
    }

    pub fn fail_bmp(&self, bmp: BmpCoords, failure: MockFailure) {
        self.state().bmp_failures.insert(bmp, failure);
    }

    pub fn fail_board(&self, bmp: BmpCoords, board: BmpBoard, failure: MockFailure) {
        self.state().board_failures.insert((bmp, board), failure);
    }

    /// Clear all injected failures.
    pub fn heal(&self) {
        let mut state = self.state();
        state.bmp_failures.clear();
        state.board_failures.clear();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn pause(&self) {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Log `call`, then fail if any addressed board has a failure injected.
    fn enter(
        &self,
        call: MockCall,
        bmp: BmpCoords,
        boards: &[BmpBoard],
        command: ScpCommand,
        operation: &'static str,
    ) -> Result<MutexGuard<'_, MockState>, CommsError> {
        trace!(?call, "mock BMP call");
        let mut state = self.state();
        state.calls.push(call);
        let failure = state.bmp_failures.get(&bmp).copied().or_else(|| {
            boards
                .iter()
                .find_map(|b| state.board_failures.get(&(bmp, *b)).copied())
        });
        match failure {
            None => Ok(state),
            Some(MockFailure::Unreachable) => {
                Err(CommsError::Timeout { operation }.exhausted(operation, MOCK_ATTEMPTS))
            }
            Some(MockFailure::Rejected(code)) => Err(CommsError::DeviceRejected { command, code }),
        }
    }
}

#[async_trait]
impl BmpTransceiver for MockBmpTransceiver {
    async fn power(
        &self,
        bmp: BmpCoords,
        boards: &[BmpBoard],
        command: PowerCommand,
    ) -> Result<(), CommsError> {
        self.pause().await;
        let call = MockCall::Power {
            bmp,
            boards: boards.to_vec(),
            command,
        };
        let mut state = self.enter(call, bmp, boards, ScpCommand::Power, "power")?;
        for board in boards {
            state
                .powered
                .insert((bmp, *board), command == PowerCommand::On);
            if command == PowerCommand::On {
                // Power cycling resets the FPGAs' link state.
                state.registers.retain(|((b, bd), _, addr), _| {
                    *b != bmp || bd != board || *addr == FPGA_FLAG_REGISTER
                });
            }
        }
        Ok(())
    }

    async fn read_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
    ) -> Result<u32, CommsError> {
        self.pause().await;
        let call = MockCall::ReadFpga {
            bmp,
            board,
            fpga,
            address,
        };
        let state = self.enter(call, bmp, &[board], ScpCommand::FpgaRead, "read FPGA register")?;
        let stored = state.registers.get(&((bmp, board), fpga, address)).copied();
        Ok(match stored {
            Some(value) => value,
            None if address == FPGA_FLAG_REGISTER => fpga,
            None => 0,
        })
    }

    async fn write_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
        value: u32,
    ) -> Result<(), CommsError> {
        self.pause().await;
        let call = MockCall::WriteFpga {
            bmp,
            board,
            fpga,
            address,
            value,
        };
        let mut state =
            self.enter(call, bmp, &[board], ScpCommand::FpgaWrite, "write FPGA register")?;
        state.registers.insert(((bmp, board), fpga, address), value);
        Ok(())
    }

    async fn read_bmp_version(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<BmpVersion, CommsError> {
        self.pause().await;
        let call = MockCall::ReadVersion(bmp, board);
        let state = self.enter(call, bmp, &[board], ScpCommand::Version, "read version")?;
        Ok(state.version.clone().unwrap_or_else(|| BmpVersion {
            major: 2,
            minor: 2,
            name: "BC&MP/Spin5-BMP".to_string(),
        }))
    }

    async fn read_serial(&self, bmp: BmpCoords, board: BmpBoard) -> Result<String, CommsError> {
        self.pause().await;
        let call = MockCall::ReadSerial(bmp, board);
        let state = self.enter(call, bmp, &[board], ScpCommand::BmpInfo, "read serial")?;
        Ok(state
            .serials
            .get(&(bmp, board))
            .cloned()
            .unwrap_or_else(|| "gorp".to_string()))
    }

    async fn read_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<Blacklist, CommsError> {
        self.pause().await;
        let call = MockCall::ReadBlacklist(bmp, board);
        let state = self.enter(call, bmp, &[board], ScpCommand::SerialFlash, "read blacklist")?;
        Ok(state.blacklists.get(&(bmp, board)).cloned().unwrap_or_default())
    }

    async fn write_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        blacklist: &Blacklist,
    ) -> Result<(), CommsError> {
        self.pause().await;
        let call = MockCall::WriteBlacklist(bmp, board);
        let mut state =
            self.enter(call, bmp, &[board], ScpCommand::SerialFlash, "write blacklist")?;
        state.blacklists.insert((bmp, board), blacklist.clone());
        Ok(())
    }

    async fn read_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, CommsError> {
        self.pause().await;
        let call = MockCall::ReadMemory(bmp, board, address);
        let state = self.enter(call, bmp, &[board], ScpCommand::Read, "read memory")?;
        Ok((0..length as u32)
            .map(|i| {
                state
                    .memory
                    .get(&((bmp, board), address + i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }

    async fn write_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        data: &[u8],
    ) -> Result<(), CommsError> {
        self.pause().await;
        let call = MockCall::WriteMemory(bmp, board, address);
        let mut state = self.enter(call, bmp, &[board], ScpCommand::Write, "write memory")?;
        for (i, byte) in data.iter().enumerate() {
            state.memory.insert(((bmp, board), address + i as u32), *byte);
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
