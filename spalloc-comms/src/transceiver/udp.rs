/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! [`BmpTransceiver`] over SCP/UDP.
//!
//! One connected socket per BMP, guarded by an async mutex so a BMP only
//! ever has one request in flight (BMP firmware handles requests strictly
//! one at a time).  Each attempt gets a fresh sequence number; replies that
//! carry a stale sequence number are discarded rather than treated as
//! errors, since they are late answers to an earlier attempt.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::{board_mask, BmpBoard, BmpCoords, BmpTransceiver, BmpVersion, PowerCommand};
use crate::blacklist::binary::MAX_ENCODED_SIZE;
use crate::blacklist::Blacklist;
use crate::error::CommsError;
use crate::scp::{ScpCommand, ScpRequest, ScpResponse, SCP_MAX_DATA, WORD_SIZE};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Offset of the blacklist within the board's serial flash.
const SERIAL_FLASH_BLACKLIST_OFFSET: u32 = 0x100;

/// `BMP_SF` sub-operations (arg3).
const SF_READ: u32 = 0;
const SF_WRITE: u32 = 1;

/// `BMP_INFO` sub-operation returning the board serial number.
const BMP_INFO_SERIAL: u32 = 0;

/// Words of serial data reported by `BMP_INFO`.
const SERIAL_WORDS: usize = 4;

/// Memory transfer widths (arg3 of READ/WRITE).
const TRANSFER_BYTES: u32 = 0;
const TRANSFER_WORDS: u32 = 2;

/// Largest datagram we expect from a BMP.
const RECEIVE_BUFFER: usize = 512;

// ── Configuration ─────────────────────────────────────────────────────────────

/// Timing and retry policy of a [`UdpBmpTransceiver`].
#[derive(Debug, Clone)]
pub struct TransceiverConfig {
    /// Per-attempt reply deadline for ordinary requests.
    pub timeout: Duration,
    /// Per-attempt reply deadline for power-on, which waits for the boards
    /// to boot.
    pub power_on_timeout: Duration,
    /// Attempts per request before giving up.
    pub retries: u32,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(500),
            power_on_timeout: Duration::from_secs(10),
            retries: 3,
        }
    }
}

// ── Transceiver ───────────────────────────────────────────────────────────────

struct BmpLink {
    socket: UdpSocket,
    next_seq: u16,
}

pub struct UdpBmpTransceiver {
    links: HashMap<BmpCoords, Mutex<BmpLink>>,
    config: TransceiverConfig,
}

impl UdpBmpTransceiver {
    /// Open one socket per BMP address.
    ///
    /// # Errors
    /// [`CommsError::Io`] if a socket cannot be bound or connected.
    pub async fn connect(
        bmps: impl IntoIterator<Item = (BmpCoords, SocketAddr)>,
        config: TransceiverConfig,
    ) -> Result<Self, CommsError> {
        let mut links = HashMap::new();
        for (coords, addr) in bmps {
            let local: SocketAddr = if addr.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = UdpSocket::bind(local).await?;
            socket.connect(addr).await?;
            debug!(bmp = %coords, address = %addr, "BMP socket connected");
            links.insert(
                coords,
                Mutex::new(BmpLink {
                    socket,
                    next_seq: 0,
                }),
            );
        }
        info!(bmps = links.len(), "UDP BMP transceiver ready");
        Ok(Self { links, config })
    }

    /// Send `request`, retrying timeouts and transient result codes.
    async fn call(
        &self,
        bmp: BmpCoords,
        request: ScpRequest,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<ScpResponse, CommsError> {
        let link = self.links.get(&bmp).ok_or(CommsError::UnknownBmp(bmp))?;
        let mut link = link.lock().await;
        let attempts = self.config.retries.max(1);
        let mut last = CommsError::Timeout { operation };

        for attempt in 1..=attempts {
            let mut req = request.clone();
            req.seq = link.next_seq;
            link.next_seq = link.next_seq.wrapping_add(1);

            let failure = match link.exchange(&req, timeout, operation).await {
                Ok(resp) if resp.result.is_ok() => return Ok(resp),
                Ok(resp) => CommsError::DeviceRejected {
                    command: req.command,
                    code: resp.result,
                },
                Err(e) => e,
            };
            if !failure.is_retryable() {
                return Err(failure);
            }
            debug!(bmp = %bmp, attempt, error = %failure, "{} will be retried", operation);
            last = failure;
        }

        warn!(bmp = %bmp, attempts, "{} gave up", operation);
        Err(last.exhausted(operation, attempts))
    }

    async fn simple(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        command: ScpCommand,
        args: [u32; 3],
        data: Vec<u8>,
        operation: &'static str,
    ) -> Result<ScpResponse, CommsError> {
        let request = ScpRequest::new(board.0, command, args).with_data(data);
        self.call(bmp, request, self.config.timeout, operation).await
    }
}

impl BmpLink {
    async fn exchange(
        &self,
        req: &ScpRequest,
        timeout: Duration,
        operation: &'static str,
    ) -> Result<ScpResponse, CommsError> {
        self.socket.send(&req.encode()).await?;
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buf = [0u8; RECEIVE_BUFFER];
        loop {
            let received = tokio::time::timeout_at(deadline, self.socket.recv(&mut buf)).await;
            let n = match received {
                Ok(result) => result?,
                Err(_) => return Err(CommsError::Timeout { operation }),
            };
            let resp = ScpResponse::decode(&buf[..n])?;
            if resp.seq != req.seq {
                trace!(expected = req.seq, got = resp.seq, "discarding stale reply");
                continue;
            }
            return Ok(resp);
        }
    }
}

#[async_trait]
impl BmpTransceiver for UdpBmpTransceiver {
    async fn power(
        &self,
        bmp: BmpCoords,
        boards: &[BmpBoard],
        command: PowerCommand,
    ) -> Result<(), CommsError> {
        if boards.is_empty() {
            return Ok(());
        }
        let on = u32::from(command == PowerCommand::On);
        let timeout = match command {
            PowerCommand::On => self.config.power_on_timeout,
            PowerCommand::Off => self.config.timeout,
        };
        let request = ScpRequest::new(0, ScpCommand::Power, [on, board_mask(boards), 0]);
        self.call(bmp, request, timeout, "power").await?;
        debug!(bmp = %bmp, boards = ?boards, power = %command, "power command acknowledged");
        Ok(())
    }

    async fn read_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
    ) -> Result<u32, CommsError> {
        let resp = self
            .simple(
                bmp,
                board,
                ScpCommand::FpgaRead,
                [address & !3, WORD_SIZE as u32, fpga],
                Vec::new(),
                "read FPGA register",
            )
            .await?;
        resp.word(0)
    }

    async fn write_fpga_register(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        fpga: u32,
        address: u32,
        value: u32,
    ) -> Result<(), CommsError> {
        let mut data = vec![0u8; WORD_SIZE];
        LittleEndian::write_u32(&mut data, value);
        self.simple(
            bmp,
            board,
            ScpCommand::FpgaWrite,
            [address & !3, WORD_SIZE as u32, fpga],
            data,
            "write FPGA register",
        )
        .await?;
        Ok(())
    }

    async fn read_bmp_version(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<BmpVersion, CommsError> {
        let resp = self
            .simple(bmp, board, ScpCommand::Version, [0; 3], Vec::new(), "read version")
            .await?;
        let version = resp.word(1)? >> 16;
        let name_bytes = resp.payload.get(3 * WORD_SIZE..).unwrap_or_default();
        let name_end = name_bytes.iter().position(|b| *b == 0).unwrap_or(name_bytes.len());
        Ok(BmpVersion {
            major: version >> 8,
            minor: version & 0xFF,
            name: String::from_utf8_lossy(&name_bytes[..name_end]).into_owned(),
        })
    }

    async fn read_serial(&self, bmp: BmpCoords, board: BmpBoard) -> Result<String, CommsError> {
        let resp = self
            .simple(
                bmp,
                board,
                ScpCommand::BmpInfo,
                [BMP_INFO_SERIAL, 0, 0],
                Vec::new(),
                "read serial",
            )
            .await?;
        let words = (0..SERIAL_WORDS)
            .map(|i| resp.word(i).map(|w| format!("{w:08x}")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(words.join("-"))
    }

    async fn read_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
    ) -> Result<Blacklist, CommsError> {
        let resp = self
            .simple(
                bmp,
                board,
                ScpCommand::SerialFlash,
                [SERIAL_FLASH_BLACKLIST_OFFSET, MAX_ENCODED_SIZE as u32, SF_READ],
                Vec::new(),
                "read blacklist",
            )
            .await?;
        Blacklist::decode(&resp.payload).map_err(|e| CommsError::MalformedResponse(e.to_string()))
    }

    async fn write_blacklist(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        blacklist: &Blacklist,
    ) -> Result<(), CommsError> {
        let data = blacklist.encode();
        self.simple(
            bmp,
            board,
            ScpCommand::SerialFlash,
            [SERIAL_FLASH_BLACKLIST_OFFSET, data.len() as u32, SF_WRITE],
            data,
            "write blacklist",
        )
        .await?;

        // Flash writes are only trusted once read back
        let stored = self.read_blacklist(bmp, board).await?;
        if &stored != blacklist {
            return Err(CommsError::MalformedResponse(format!(
                "blacklist read back from {bmp} {board} differs from what was written"
            )));
        }
        Ok(())
    }

    async fn read_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        length: usize,
    ) -> Result<Vec<u8>, CommsError> {
        let mut out = Vec::with_capacity(length);
        while out.len() < length {
            let chunk = (length - out.len()).min(SCP_MAX_DATA);
            let at = address + out.len() as u32;
            let resp = self
                .simple(
                    bmp,
                    board,
                    ScpCommand::Read,
                    [at, chunk as u32, transfer_width(at, chunk)],
                    Vec::new(),
                    "read memory",
                )
                .await?;
            let data = resp.payload.get(..chunk).ok_or_else(|| {
                CommsError::MalformedResponse(format!(
                    "asked for {chunk} bytes at {at:#x}, got {}",
                    resp.payload.len()
                ))
            })?;
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    async fn write_memory(
        &self,
        bmp: BmpCoords,
        board: BmpBoard,
        address: u32,
        data: &[u8],
    ) -> Result<(), CommsError> {
        let mut offset = 0usize;
        for chunk in data.chunks(SCP_MAX_DATA) {
            let at = address + offset as u32;
            self.simple(
                bmp,
                board,
                ScpCommand::Write,
                [at, chunk.len() as u32, transfer_width(at, chunk.len())],
                chunk.to_vec(),
                "write memory",
            )
            .await?;
            offset += chunk.len();
        }
        Ok(())
    }
}

fn transfer_width(address: u32, length: usize) -> u32 {
    if address % WORD_SIZE as u32 == 0 && length % WORD_SIZE == 0 {
        TRANSFER_WORDS
    } else {
        TRANSFER_BYTES
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scp::ResultCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    type Reply = Option<(ResultCode, Vec<u8>)>;

    /// Helper: a fake BMP answering each request through `respond`.
    async fn fake_bmp<F>(mut respond: F) -> SocketAddr
    where
        F: FnMut(u16, [u32; 3], Vec<u8>) -> Reply + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                let (header, cmd, seq, args, data) = ScpRequest::decode(&buf[..n]).unwrap();
                if let Some((result, payload)) = respond(cmd, args, data) {
                    let resp = ScpResponse {
                        header,
                        result,
                        seq,
                        payload,
                    };
                    socket.send_to(&resp.encode(), from).await.unwrap();
                }
            }
        });
        addr
    }

    fn fast_config() -> TransceiverConfig {
        TransceiverConfig {
            timeout: Duration::from_millis(50),
            power_on_timeout: Duration::from_millis(50),
            retries: 3,
        }
    }

    const BMP: BmpCoords = BmpCoords::new(0, 0);

    async fn transceiver(addr: SocketAddr) -> UdpBmpTransceiver {
        UdpBmpTransceiver::connect([(BMP, addr)], fast_config())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn power_sends_mask_and_state() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let addr = fake_bmp(move |cmd, args, _| {
            log.lock().unwrap().push((cmd, args));
            Some((ResultCode::OK, Vec::new()))
        })
        .await;
        let txrx = transceiver(addr).await;

        txrx.power(BMP, &[BmpBoard(1), BmpBoard(2)], PowerCommand::On)
            .await
            .unwrap();
        txrx.power(BMP, &[BmpBoard(1)], PowerCommand::Off).await.unwrap();
        txrx.power(BMP, &[], PowerCommand::Off).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], (57, [1, 0b110, 0]));
        assert_eq!(seen[1], (57, [0, 0b10, 0]));
    }

    #[tokio::test]
    async fn dropped_request_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let addr = fake_bmp(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                None
            } else {
                Some((ResultCode::OK, vec![0x78, 0x56, 0x34, 0x12]))
            }
        })
        .await;
        let txrx = transceiver(addr).await;

        let flag = txrx
            .read_fpga_register(BMP, BmpBoard(0), 1, 0x0004_0004)
            .await
            .unwrap();
        assert_eq!(flag, 0x1234_5678);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn silent_bmp_exhausts_retry_budget() {
        let addr = fake_bmp(|_, _, _| None).await;
        let txrx = transceiver(addr).await;
        let err = txrx.read_serial(BMP, BmpBoard(0)).await.unwrap_err();
        assert!(matches!(err, CommsError::CommsFailure { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let addr = fake_bmp(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some((ResultCode::ARG, Vec::new()))
        })
        .await;
        let txrx = transceiver(addr).await;
        let err = txrx
            .write_fpga_register(BMP, BmpBoard(0), 0, 0x5C, 1)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CommsError::DeviceRejected {
                command: ScpCommand::FpgaWrite,
                code: ResultCode::ARG
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_bmp_is_reported() {
        let addr = fake_bmp(|_, _, _| None).await;
        let txrx = transceiver(addr).await;
        let err = txrx
            .power(BmpCoords::new(9, 9), &[BmpBoard(0)], PowerCommand::Off)
            .await
            .unwrap_err();
        assert!(matches!(err, CommsError::UnknownBmp(_)));
    }

    #[tokio::test]
    async fn version_reply_is_parsed() {
        let addr = fake_bmp(|_, _, _| {
            let mut payload = vec![0u8; 12];
            LittleEndian::write_u32(&mut payload[4..8], (0x0202 << 16) | 256);
            payload.extend_from_slice(b"BC&MP/Spin5-BMP\0");
            Some((ResultCode::OK, payload))
        })
        .await;
        let txrx = transceiver(addr).await;
        let v = txrx.read_bmp_version(BMP, BmpBoard(0)).await.unwrap();
        assert_eq!((v.major, v.minor), (2, 2));
        assert_eq!(v.name, "BC&MP/Spin5-BMP");
        assert!(v.can_manage_fpgas());
    }

    #[tokio::test]
    async fn blacklist_write_is_verified_by_read_back() {
        let flash = Arc::new(std::sync::Mutex::new(Vec::new()));
        let store = Arc::clone(&flash);
        let addr = fake_bmp(move |cmd, args, data| {
            assert_eq!(cmd, ScpCommand::SerialFlash.code());
            assert_eq!(args[0], SERIAL_FLASH_BLACKLIST_OFFSET);
            let mut flash = store.lock().unwrap();
            if args[2] == SF_WRITE {
                *flash = data;
                Some((ResultCode::OK, Vec::new()))
            } else {
                Some((ResultCode::OK, flash.clone()))
            }
        })
        .await;
        let txrx = transceiver(addr).await;

        let bl = Blacklist::parse("chip 5 5 core 5").unwrap();
        txrx.write_blacklist(BMP, BmpBoard(3), &bl).await.unwrap();
        assert_eq!(txrx.read_blacklist(BMP, BmpBoard(3)).await.unwrap(), bl);
    }
}
