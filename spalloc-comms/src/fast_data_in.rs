/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fast Data In: bulk upload through a data-gatherer core.
//!
//! The host streams sequence-numbered chunks without waiting for
//! acknowledgements, then sends a "tell" marker.  The gatherer answers either
//! "finished" or one or more "missing" packets listing the sequence numbers
//! it did not receive; exactly those are resent, followed by another tell.
//!
//! | Packet | Payload words |
//! |---|---|
//! | location | `200, txid, base, (x<<16)\|y, n_packets-1` |
//! | seq data | `2000, txid, seq, data...` |
//! | tell | `2001, txid` |
//! | missing (reply) | `2002, txid, seq..., [0xFFFFFFFF]` |
//! | finished (reply) | `2003, txid` |
//!
//! Re-delivering a chunk writes the same bytes to the same address, so
//! duplicate deliveries have no further effect.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use crate::error::CommsError;
use crate::geometry::ChipLocation;
use crate::scp::{SDP_PAYLOAD_BYTES, WORD_SIZE};

// ── Protocol constants ────────────────────────────────────────────────────────

pub const SEND_DATA_TO_LOCATION: u32 = 200;
pub const SEND_SEQ_DATA: u32 = 2000;
pub const SEND_TELL_DATA_IN: u32 = 2001;
pub const RECEIVE_MISSING_SEQ_DATA_IN: u32 = 2002;
pub const RECEIVE_FINISHED_DATA_IN: u32 = 2003;

/// In a missing list: every packet was lost.
const MISSING_ALL: u32 = 0xFFFF_FFFE;
/// In a missing list: no further missing packets follow.
const MISSING_END: u32 = 0xFFFF_FFFF;

/// Data bytes carried by one sequence packet.
pub const DATA_BYTES_PER_PACKET: usize = SDP_PAYLOAD_BYTES - 3 * WORD_SIZE;

pub const DEFAULT_RETRY_LIMIT: u32 = 20;

const OPERATION: &str = "fast data in";

// ── Channel ───────────────────────────────────────────────────────────────────

/// Datagram channel to a data-gatherer core.
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, payload: Vec<u8>) -> Result<(), CommsError>;

    /// Next datagram, or `None` once `timeout` passes with nothing received.
    async fn receive(&self, timeout: Duration) -> Result<Option<Vec<u8>>, CommsError>;
}

// ── Uploader ──────────────────────────────────────────────────────────────────

/// Counters describing one finished upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub packets: u32,
    pub retransmitted: u32,
    pub timeouts: u32,
}

pub struct FastDataIn<C> {
    channel: C,
    timeout: Duration,
    retry_limit: u32,
    transaction_id: u32,
}

impl<C: DataChannel> FastDataIn<C> {
    pub fn new(channel: C, timeout: Duration) -> Self {
        Self {
            channel,
            timeout,
            retry_limit: DEFAULT_RETRY_LIMIT,
            transaction_id: 0,
        }
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Write `data` to `base` on `chip`.
    ///
    /// # Errors
    /// * [`CommsError::CommsFailure`] after more than `retry_limit`
    ///   consecutive timeouts
    /// * [`CommsError::MalformedResponse`] for a reply naming a sequence
    ///   number that was never sent
    pub async fn upload(
        &mut self,
        chip: ChipLocation,
        base: u32,
        data: &[u8],
    ) -> Result<UploadStats, CommsError> {
        let chunks: Vec<&[u8]> = data.chunks(DATA_BYTES_PER_PACKET).collect();
        if chunks.is_empty() {
            return Ok(UploadStats::default());
        }
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let txid = self.transaction_id;
        let n_packets = chunks.len() as u32;
        let mut stats = UploadStats {
            packets: n_packets,
            ..UploadStats::default()
        };
        debug!(txid, bytes = data.len(), packets = n_packets, %chip, "streaming");

        self.send_burst(txid, chip, base, &chunks).await?;

        // None until the gatherer has told us anything about gaps.
        let mut missing: Option<BTreeSet<u32>> = None;
        let mut consecutive_timeouts = 0u32;

        loop {
            let Some(reply) = self.channel.receive(self.timeout).await? else {
                consecutive_timeouts += 1;
                stats.timeouts += 1;
                if consecutive_timeouts > self.retry_limit {
                    warn!(txid, "ran out of attempts due to timeouts");
                    return Err(
                        CommsError::Timeout { operation: OPERATION }
                            .exhausted(OPERATION, consecutive_timeouts),
                    );
                }
                match &mut missing {
                    None => {
                        debug!(txid, "full timeout; resending initial packets");
                        stats.retransmitted += n_packets;
                        self.send_burst(txid, chip, base, &chunks).await?;
                    }
                    Some(set) => {
                        debug!(txid, timeout = consecutive_timeouts, "timeout; resending known gaps");
                        stats.retransmitted += set.len() as u32;
                        self.retransmit(txid, &chunks, set).await?;
                        set.clear();
                    }
                }
                continue;
            };
            consecutive_timeouts = 0;

            let words = payload_words(&reply)?;
            if words[1] != txid {
                trace!(txid, got = words[1], "ignoring reply for another transaction");
                continue;
            }
            match words[0] {
                RECEIVE_FINISHED_DATA_IN => {
                    debug!(txid, ?stats, "upload finished");
                    return Ok(stats);
                }
                RECEIVE_MISSING_SEQ_DATA_IN => {
                    if words.len() < 3 {
                        return Err(CommsError::MalformedResponse(
                            "missing-sequence reply lists nothing".to_string(),
                        ));
                    }
                    let set = missing.get_or_insert_with(BTreeSet::new);
                    if add_missing(&words[2..], set, n_packets)? {
                        stats.retransmitted += set.len() as u32;
                        self.retransmit(txid, &chunks, set).await?;
                        set.clear();
                    }
                }
                other => {
                    warn!(txid, command = other, "unexpected reply from gatherer");
                }
            }
        }
    }

    async fn send_burst(
        &self,
        txid: u32,
        chip: ChipLocation,
        base: u32,
        chunks: &[&[u8]],
    ) -> Result<(), CommsError> {
        let location = words_to_bytes(&[
            SEND_DATA_TO_LOCATION,
            txid,
            base,
            (chip.x << 16) | chip.y,
            chunks.len() as u32 - 1,
        ]);
        self.channel.send(location).await?;
        for (seq, chunk) in chunks.iter().enumerate() {
            self.channel.send(seq_packet(txid, seq as u32, chunk)).await?;
        }
        self.channel.send(tell_packet(txid)).await
    }

    async fn retransmit(
        &self,
        txid: u32,
        chunks: &[&[u8]],
        missing: &BTreeSet<u32>,
    ) -> Result<(), CommsError> {
        debug!(txid, packets = missing.len(), "retransmitting");
        for seq in missing {
            let chunk = chunks[*seq as usize];
            self.channel.send(seq_packet(txid, *seq, chunk)).await?;
        }
        self.channel.send(tell_packet(txid)).await
    }
}

/// Fold a missing list into `set`.  Returns `true` once the list is
/// complete (end marker or "all missing" seen).
fn add_missing(words: &[u32], set: &mut BTreeSet<u32>, n_packets: u32) -> Result<bool, CommsError> {
    for &word in words {
        match word {
            MISSING_END => return Ok(true),
            MISSING_ALL => {
                set.extend(0..n_packets);
                return Ok(true);
            }
            seq if seq >= n_packets => {
                return Err(CommsError::MalformedResponse(format!(
                    "missing sequence number {seq} but only {n_packets} packets were sent"
                )));
            }
            seq => {
                set.insert(seq);
            }
        }
    }
    Ok(false)
}

fn payload_words(reply: &[u8]) -> Result<Vec<u32>, CommsError> {
    if reply.len() < 2 * WORD_SIZE || reply.len() % WORD_SIZE != 0 {
        return Err(CommsError::MalformedResponse(format!(
            "gatherer reply of {} bytes is not a whole number of words",
            reply.len()
        )));
    }
    Ok(reply.chunks_exact(WORD_SIZE).map(LittleEndian::read_u32).collect())
}

fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    let mut buf = vec![0u8; words.len() * WORD_SIZE];
    LittleEndian::write_u32_into(words, &mut buf);
    buf
}

fn seq_packet(txid: u32, seq: u32, chunk: &[u8]) -> Vec<u8> {
    let mut buf = words_to_bytes(&[SEND_SEQ_DATA, txid, seq]);
    buf.extend_from_slice(chunk);
    buf
}

fn tell_packet(txid: u32) -> Vec<u8> {
    words_to_bytes(&[SEND_TELL_DATA_IN, txid])
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Mutex;

    /// Helper: a gatherer that applies chunks to an in-memory image and
    /// answers each tell from a script.
    #[derive(Default)]
    struct ScriptedGatherer {
        inner: Mutex<GathererState>,
    }

    #[derive(Default)]
    struct GathererState {
        /// Sequence numbers to drop on first sight.
        drop_once: BTreeSet<u32>,
        /// Replies queued per tell; `None` stays silent.
        script: VecDeque<Option<Vec<u32>>>,
        outbox: VecDeque<Vec<u8>>,
        base: u32,
        memory: BTreeMap<u32, u8>,
        deliveries: BTreeMap<u32, u32>,
        sent: Vec<u32>,
    }

    impl ScriptedGatherer {
        fn state(&self) -> std::sync::MutexGuard<'_, GathererState> {
            self.inner.lock().unwrap()
        }
    }

    #[async_trait]
    impl DataChannel for ScriptedGatherer {
        async fn send(&self, payload: Vec<u8>) -> Result<(), CommsError> {
            let words = payload_words(&payload[..8]).unwrap();
            let mut st = self.state();
            st.sent.push(words[0]);
            match words[0] {
                SEND_DATA_TO_LOCATION => {
                    st.base = LittleEndian::read_u32(&payload[8..]);
                }
                SEND_SEQ_DATA => {
                    let seq = LittleEndian::read_u32(&payload[8..]);
                    if st.drop_once.remove(&seq) {
                        return Ok(());
                    }
                    *st.deliveries.entry(seq).or_default() += 1;
                    let at = st.base + seq * DATA_BYTES_PER_PACKET as u32;
                    for (i, b) in payload[12..].iter().enumerate() {
                        st.memory.insert(at + i as u32, *b);
                    }
                }
                SEND_TELL_DATA_IN => {
                    if let Some(Some(reply)) = st.script.pop_front() {
                        st.outbox.push_back(words_to_bytes(&reply));
                    }
                }
                other => panic!("unexpected command {other}"),
            }
            Ok(())
        }

        async fn receive(&self, _timeout: Duration) -> Result<Option<Vec<u8>>, CommsError> {
            Ok(self.state().outbox.pop_front())
        }
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn uploaded(g: &ScriptedGatherer, base: u32, len: usize) -> Vec<u8> {
        let st = g.state();
        (0..len as u32).map(|i| st.memory[&(base + i)]).collect()
    }

    const CHIP: ChipLocation = ChipLocation::new(1, 2);

    // ── Happy path ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn clean_upload_finishes_after_one_burst() {
        let g = ScriptedGatherer::default();
        g.state().script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));

        let bytes = data(DATA_BYTES_PER_PACKET * 2 + 7);
        let stats = fdi.upload(CHIP, 0x6000_0000, &bytes).await.unwrap();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.retransmitted, 0);
        assert_eq!(uploaded(fdi.channel(), 0x6000_0000, bytes.len()), bytes);
        assert_eq!(
            fdi.channel().state().sent,
            vec![200, 2000, 2000, 2000, 2001]
        );
    }

    #[tokio::test]
    async fn empty_upload_sends_nothing() {
        let mut fdi = FastDataIn::new(ScriptedGatherer::default(), Duration::from_millis(10));
        assert_eq!(fdi.upload(CHIP, 0, &[]).await.unwrap(), UploadStats::default());
        assert!(fdi.channel().state().sent.is_empty());
    }

    #[test]
    fn location_packet_layout() {
        let packet = words_to_bytes(&[SEND_DATA_TO_LOCATION, 7, 0x1000, (3 << 16) | 4, 9]);
        assert_eq!(packet.len(), 20);
        assert_eq!(LittleEndian::read_u16(&packet[12..]), 4); // y first
        assert_eq!(LittleEndian::read_u16(&packet[14..]), 3);
        assert_eq!(DATA_BYTES_PER_PACKET, 260);
    }

    // ── Retransmission ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn resends_exactly_the_missing_chunks() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            st.drop_once.extend([1, 3]);
            st.script.push_back(Some(vec![RECEIVE_MISSING_SEQ_DATA_IN, 1, 1, 3, MISSING_END]));
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let bytes = data(DATA_BYTES_PER_PACKET * 4);
        let stats = fdi.upload(CHIP, 0x100, &bytes).await.unwrap();

        assert_eq!(stats.retransmitted, 2);
        assert_eq!(uploaded(fdi.channel(), 0x100, bytes.len()), bytes);
        let st = fdi.channel().state();
        assert_eq!(st.deliveries.values().copied().collect::<Vec<_>>(), vec![1, 1, 1, 1]);
    }

    #[tokio::test]
    async fn missing_list_split_over_packets_waits_for_end_marker() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            st.drop_once.extend([0, 2]);
            // Two replies to the first tell: the list is only complete on the second.
            st.outbox.push_back(words_to_bytes(&[RECEIVE_MISSING_SEQ_DATA_IN, 1, 0]));
            st.script.push_back(Some(vec![RECEIVE_MISSING_SEQ_DATA_IN, 1, 2, MISSING_END]));
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let bytes = data(DATA_BYTES_PER_PACKET * 3);
        let stats = fdi.upload(CHIP, 0, &bytes).await.unwrap();
        assert_eq!(stats.retransmitted, 2);
        assert_eq!(uploaded(fdi.channel(), 0, bytes.len()), bytes);
    }

    #[tokio::test]
    async fn all_missing_marker_resends_everything() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            st.script.push_back(Some(vec![RECEIVE_MISSING_SEQ_DATA_IN, 1, MISSING_ALL]));
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let stats = fdi.upload(CHIP, 0, &data(600)).await.unwrap();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.retransmitted, 3);
    }

    #[tokio::test]
    async fn redelivered_chunks_have_no_further_effect() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            // Nothing was lost, but the gatherer asks for chunk 1 anyway.
            st.script.push_back(Some(vec![RECEIVE_MISSING_SEQ_DATA_IN, 1, 1, MISSING_END]));
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let bytes = data(DATA_BYTES_PER_PACKET * 2);
        fdi.upload(CHIP, 0x40, &bytes).await.unwrap();

        assert_eq!(uploaded(fdi.channel(), 0x40, bytes.len()), bytes);
        let st = fdi.channel().state();
        assert_eq!(st.deliveries[&1], 2);
        assert_eq!(st.memory.len(), bytes.len());
    }

    #[tokio::test]
    async fn silent_gatherer_gets_full_burst_again() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            st.script.push_back(None);
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let stats = fdi.upload(CHIP, 0, &data(10)).await.unwrap();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(fdi.channel().state().sent, vec![200, 2000, 2001, 200, 2000, 2001]);
    }

    // ── Failures ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn gives_up_after_retry_limit() {
        let mut fdi = FastDataIn::new(ScriptedGatherer::default(), Duration::from_millis(1))
            .with_retry_limit(2);
        let err = fdi.upload(CHIP, 0, &data(10)).await.unwrap_err();
        assert!(matches!(err, CommsError::CommsFailure { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn out_of_range_sequence_number_is_malformed() {
        let g = ScriptedGatherer::default();
        g.state()
            .script
            .push_back(Some(vec![RECEIVE_MISSING_SEQ_DATA_IN, 1, 5, MISSING_END]));
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let err = fdi.upload(CHIP, 0, &data(10)).await.unwrap_err();
        assert!(matches!(err, CommsError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn replies_for_other_transactions_are_ignored() {
        let g = ScriptedGatherer::default();
        {
            let mut st = g.state();
            st.outbox.push_back(words_to_bytes(&[RECEIVE_FINISHED_DATA_IN, 99]));
            st.script.push_back(Some(vec![RECEIVE_FINISHED_DATA_IN, 1]));
        }
        let mut fdi = FastDataIn::new(g, Duration::from_millis(10));
        let stats = fdi.upload(CHIP, 0, &data(10)).await.unwrap();
        assert_eq!(stats.timeouts, 0);
    }
}
