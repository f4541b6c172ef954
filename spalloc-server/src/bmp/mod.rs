/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! BMP controller: drains `pending_changes` onto the hardware.
//!
//! One round of [`BmpController::process_pending`]:
//!
//! 1. takes every change not yet in progress and marks it in progress;
//! 2. groups the changes by BMP and runs the BMPs in parallel on the
//!    [`WorkerPool`];
//! 3. within a BMP, works in change-id order, batching consecutive changes
//!    with the same power direction into one command;
//! 4. writes the results back and reports finished jobs to the
//!    [`JobManager`].
//!
//! Commands to one board go through that board's FIFO lock, so they reach
//! the BMP in submission order even across rounds.
//!
//! | Step after power-on | Condition |
//! |---|---|
//! | FPGA flag check, re-power on mismatch | firmware can manage FPGAs |
//! | Stop links leaving the allocation | firmware can manage FPGAs |
//! | Write an unsynced stored blacklist to the board | `blacklist_sync` |
//! | Otherwise read the board's blacklist into the store | `blacklist_sync` |
//! | Read serial number | serial not yet known |

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use spalloc_comms::transceiver::{link_stop_register, FPGA_COUNT, FPGA_FLAG_ID_MASK, FPGA_FLAG_REGISTER};
use spalloc_comms::{
    Blacklist, BmpBoard, BmpCoords, BmpTransceiver, BmpVersion, CommsError, Direction,
    PowerCommand,
};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::db::{BoardId, ChangeId, Database, DbError, JobId, MachineId};
use crate::executor::{Progress, TaskFailure, WorkerPool};
use crate::health::HealthRegistry;
use crate::jobs::{JobError, JobManager, JobState, PowerOutcome};

// ── Settings and errors ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmpSettings {
    /// Attempts per BMP operation, counting the first.
    pub power_attempts: u32,
    /// Re-powers allowed for a board whose FPGAs did not load.
    pub fpga_attempts: u32,
    /// Read each board's blacklist after power-on.
    pub blacklist_sync: bool,
    /// BMPs worked on at once.
    pub parallelism: usize,
}

impl Default for BmpSettings {
    fn default() -> Self {
        Self {
            power_attempts: 2,
            fpga_attempts: 3,
            blacklist_sync: true,
            parallelism: 4,
        }
    }
}

#[derive(Debug, Error)]
pub enum BmpError {
    #[error("BMP {bmp} is unreachable: {source}")]
    Unreachable {
        bmp: BmpCoords,
        #[source]
        source: CommsError,
    },

    #[error("{operation} failed on board {board}: {source}")]
    Board {
        board: BoardId,
        operation: &'static str,
        #[source]
        source: CommsError,
    },

    #[error("board {board} has no stored blacklist")]
    NoBlacklist { board: BoardId },

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Db(#[from] DbError),
}

/// Failures worth another attempt.  An exhausted transceiver budget is one
/// of them: the BMP may simply have been busy.
fn worth_retrying(err: &CommsError) -> bool {
    err.is_retryable() || matches!(err, CommsError::CommsFailure { .. })
}

// ── Work items ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct WorkItem {
    change: ChangeId,
    job: Option<JobId>,
    board: BoardId,
    bmp: BmpCoords,
    slot: BmpBoard,
    power: PowerCommand,
    to_state: JobState,
    stop_links: Vec<Direction>,
    needs_serial: bool,
    /// Stored blacklist edited since it last reached the board, with the
    /// edit's timestamp.
    push_blacklist: Option<(Blacklist, Option<DateTime<Utc>>)>,
}

/// What a successful change learnt about its board.
#[derive(Debug, Default)]
struct BoardReport {
    serial: Option<String>,
    /// Read from the board.
    blacklist: Option<Blacklist>,
    /// The stored blacklist was written to the board.
    blacklist_pushed: bool,
}

#[derive(Debug)]
struct ChangeResult {
    item: WorkItem,
    outcome: Result<BoardReport, String>,
}

/// Consecutive same-direction changes, each board at most once.
fn batches(items: Vec<WorkItem>) -> Vec<Vec<WorkItem>> {
    let mut out: Vec<Vec<WorkItem>> = Vec::new();
    for item in items {
        let fits = out.last().is_some_and(|batch| {
            batch[0].power == item.power && batch.iter().all(|b| b.board != item.board)
        });
        match out.last_mut() {
            Some(batch) if fits => batch.push(item),
            _ => out.push(vec![item]),
        }
    }
    out
}

/// What one round did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ProcessReport {
    pub applied: usize,
    pub failed: usize,
    /// Retried next round.
    pub requeued: usize,
    pub completed_jobs: Vec<JobId>,
    pub failed_jobs: Vec<JobId>,
}

/// Outcome of [`BmpController::recheck_boards`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecheckReport {
    pub alive: Vec<BoardId>,
    pub dead: Vec<BoardId>,
}

// ── Hardware side ─────────────────────────────────────────────────────────────

struct Shared {
    txrx: Arc<dyn BmpTransceiver>,
    settings: BmpSettings,
    board_locks: Mutex<HashMap<BoardId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Shared {
    async fn lock_board(&self, board: BoardId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.board_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(board).or_default())
        };
        lock.lock_owned().await
    }

    async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, CommsError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CommsError>>,
    {
        let attempts = self.settings.power_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < attempts && worth_retrying(&e) => {
                    debug!(operation, attempt, error = %e, "retrying BMP operation");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn power(
        &self,
        bmp: BmpCoords,
        slots: &[BmpBoard],
        command: PowerCommand,
    ) -> Result<(), CommsError> {
        let txrx = self.txrx.as_ref();
        self.retry("power", move || txrx.power(bmp, slots, command)).await
    }

    /// The firmware version, asked of the first board that answers.
    async fn version(&self, bmp: BmpCoords, slots: &[BmpBoard]) -> Result<BmpVersion, BmpError> {
        let txrx = self.txrx.as_ref();
        let mut last = None;
        for slot in slots {
            let slot = *slot;
            match self.retry("read version", move || txrx.read_bmp_version(bmp, slot)).await {
                Ok(v) => return Ok(v),
                Err(e) => last = Some(e),
            }
        }
        Err(BmpError::Unreachable {
            bmp,
            source: last.unwrap_or(CommsError::UnknownBmp(bmp)),
        })
    }

    async fn fpgas_loaded(&self, bmp: BmpCoords, slot: BmpBoard) -> Result<bool, CommsError> {
        let txrx = self.txrx.as_ref();
        for fpga in 0..FPGA_COUNT {
            let flag = self
                .retry("read FPGA flag", move || {
                    txrx.read_fpga_register(bmp, slot, fpga, FPGA_FLAG_REGISTER)
                })
                .await?;
            if flag & FPGA_FLAG_ID_MASK != fpga {
                warn!(%bmp, %slot, fpga, flag, "FPGA reports wrong id");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Everything after a board has been switched on.
    async fn finish_power_on(
        &self,
        item: &WorkItem,
        version: &BmpVersion,
    ) -> Result<BoardReport, String> {
        let (bmp, slot) = (item.bmp, item.slot);
        let txrx = self.txrx.as_ref();

        if version.can_manage_fpgas() {
            let mut reloads = 0;
            loop {
                match self.fpgas_loaded(bmp, slot).await {
                    Ok(true) => break,
                    Ok(false) if reloads < self.settings.fpga_attempts => {
                        reloads += 1;
                        info!(board = item.board, reloads, "re-powering board to reload FPGAs");
                        self.power(bmp, &[slot], PowerCommand::Off)
                            .await
                            .map_err(|e| format!("power off for FPGA reload: {e}"))?;
                        self.power(bmp, &[slot], PowerCommand::On)
                            .await
                            .map_err(|e| format!("power on for FPGA reload: {e}"))?;
                    }
                    Ok(false) => {
                        return Err(format!("FPGAs did not load after {reloads} re-power(s)"));
                    }
                    Err(e) => return Err(format!("FPGA check: {e}")),
                }
            }

            for direction in &item.stop_links {
                let (fpga, address) = link_stop_register(*direction);
                self.retry("stop link", move || {
                    txrx.write_fpga_register(bmp, slot, fpga, address, 1)
                })
                .await
                .map_err(|e| format!("stopping {direction:?} link: {e}"))?;
            }
        }

        let mut report = BoardReport::default();
        if self.settings.blacklist_sync {
            match &item.push_blacklist {
                // The board's copy is stale; reading it back would lose the edit.
                Some((stored, _)) => {
                    self.retry("write blacklist", move || {
                        txrx.write_blacklist(bmp, slot, stored)
                    })
                    .await
                    .map_err(|e| format!("writing blacklist: {e}"))?;
                    report.blacklist_pushed = true;
                }
                None => {
                    let blacklist = self
                        .retry("read blacklist", move || txrx.read_blacklist(bmp, slot))
                        .await
                        .map_err(|e| format!("reading blacklist: {e}"))?;
                    report.blacklist = Some(blacklist);
                }
            }
        }
        if item.needs_serial {
            // A missing serial number does not make the board unusable.
            match self.retry("read serial", move || txrx.read_serial(bmp, slot)).await {
                Ok(serial) => report.serial = Some(serial),
                Err(e) => debug!(board = item.board, error = %e, "serial number unavailable"),
            }
        }
        Ok(report)
    }

    /// Switch one batch, falling back to board-by-board when the batch
    /// command fails so one bad board cannot fail its neighbours.
    async fn run_batch(
        &self,
        batch: Vec<WorkItem>,
        version: Option<&BmpVersion>,
        progress: &Progress,
    ) -> Vec<ChangeResult> {
        let bmp = batch[0].bmp;
        let command = batch[0].power;

        let mut boards: Vec<BoardId> = batch.iter().map(|i| i.board).collect();
        boards.sort_unstable();
        let mut guards = Vec::with_capacity(boards.len());
        for board in boards {
            guards.push(self.lock_board(board).await);
        }

        let slots: Vec<BmpBoard> = batch.iter().map(|i| i.slot).collect();
        let switched: Vec<Result<(), String>> = match self.power(bmp, &slots, command).await {
            Ok(()) => vec![Ok(()); batch.len()],
            Err(e) if batch.len() == 1 => vec![Err(e.to_string())],
            Err(e) => {
                debug!(%bmp, %command, error = %e, "batch power failed; trying boards singly");
                let mut each = Vec::with_capacity(batch.len());
                for item in &batch {
                    each.push(
                        self.power(bmp, &[item.slot], command)
                            .await
                            .map_err(|e| e.to_string()),
                    );
                }
                each
            }
        };

        let mut results = Vec::with_capacity(batch.len());
        for (item, switched) in batch.into_iter().zip(switched) {
            let outcome = match (switched, command, version) {
                (Err(e), ..) => Err(e),
                (Ok(()), PowerCommand::On, Some(version)) => {
                    self.finish_power_on(&item, version).await
                }
                (Ok(()), ..) => Ok(BoardReport::default()),
            };
            if let Err(reason) = &outcome {
                warn!(board = item.board, %command, %reason, "power change failed");
            }
            progress.step();
            results.push(ChangeResult { item, outcome });
        }
        drop(guards);
        results
    }

    /// Every change for one BMP, in order.
    async fn run_bmp(
        &self,
        bmp: BmpCoords,
        items: Vec<WorkItem>,
        progress: Progress,
    ) -> Result<Vec<ChangeResult>, BmpError> {
        let mut version = None;
        if items.iter().any(|i| i.power == PowerCommand::On) {
            let slots: Vec<BmpBoard> = items.iter().map(|i| i.slot).collect();
            version = Some(self.version(bmp, &slots).await?);
        }
        let mut results = Vec::with_capacity(items.len());
        for batch in batches(items) {
            results.extend(self.run_batch(batch, version.as_ref(), &progress).await);
        }
        Ok(results)
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BmpController {
    db: Arc<Database>,
    health: HealthRegistry,
    jobs: JobManager,
    pool: WorkerPool,
    shared: Arc<Shared>,
}

impl BmpController {
    pub fn new(
        db: Arc<Database>,
        jobs: JobManager,
        txrx: Arc<dyn BmpTransceiver>,
        settings: BmpSettings,
    ) -> Self {
        Self {
            health: HealthRegistry::new(Arc::clone(&db)),
            pool: WorkerPool::new(settings.parallelism),
            shared: Arc::new(Shared {
                txrx,
                settings,
                board_locks: Mutex::new(HashMap::new()),
            }),
            db,
            jobs,
        }
    }

    pub fn settings(&self) -> &BmpSettings {
        &self.shared.settings
    }

    fn take_pending(&self) -> Result<Vec<WorkItem>, DbError> {
        self.db.transaction(|t| {
            let ids: Vec<ChangeId> = t
                .pending_changes
                .values()
                .filter(|c| !c.in_progress)
                .map(|c| c.id)
                .collect();
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                let Some(change) = t.pending_changes.get(&id) else {
                    continue;
                };
                let board = t.board(change.board_id)?;
                let push_blacklist =
                    if change.power == PowerCommand::On && board.blacklist_unsynced() {
                        let stored = t.read_blacklist(board.id)?.unwrap_or_default();
                        Some((stored, board.blacklist_set))
                    } else {
                        None
                    };
                items.push(WorkItem {
                    change: id,
                    job: change.job_id,
                    board: board.id,
                    bmp: board.physical.bmp(),
                    slot: board.physical.bmp_board(),
                    power: change.power,
                    to_state: change.to_state,
                    stop_links: change.stop_links.clone(),
                    needs_serial: board.bmp_serial.is_none(),
                    push_blacklist,
                });
                if let Some(change) = t.pending_changes.get_mut(&id) {
                    change.in_progress = true;
                }
            }
            Ok(items)
        })
    }

    fn requeue(&self, items: &[WorkItem]) -> Result<(), DbError> {
        self.db.transaction(|t| {
            for item in items {
                if let Some(change) = t.pending_changes.get_mut(&item.change) {
                    change.in_progress = false;
                }
            }
            Ok(())
        })
    }

    /// Write the hardware results back; returns the jobs with failed
    /// power-ons and the boards that failed them.
    fn apply(
        &self,
        results: &[ChangeResult],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<JobId, (String, Vec<BoardId>)>, DbError> {
        self.db.transaction(|t| {
            let mut failed: BTreeMap<JobId, (String, Vec<BoardId>)> = BTreeMap::new();
            for r in results {
                let item = &r.item;
                t.pending_changes.remove(&item.change);
                match &r.outcome {
                    Ok(report) => {
                        let board = t.board_mut(item.board)?;
                        match item.power {
                            PowerCommand::On => {
                                board.powered = true;
                                board.power_on_timestamp = Some(now);
                            }
                            PowerCommand::Off => {
                                board.powered = false;
                                board.power_off_timestamp = Some(now);
                            }
                        }
                        if let Some(serial) = &report.serial {
                            board.bmp_serial = Some(serial.clone());
                        }
                        if let Some(blacklist) = &report.blacklist {
                            if t.board(item.board)?.blacklist_unsynced() {
                                debug!(board = item.board, "stored blacklist edited meanwhile");
                            } else {
                                t.write_blacklist(item.board, blacklist, now)?;
                                t.board_mut(item.board)?.blacklist_sync = Some(now);
                            }
                        }
                        if report.blacklist_pushed {
                            let pushed_set =
                                item.push_blacklist.as_ref().and_then(|(_, set)| *set);
                            let board = t.board_mut(item.board)?;
                            // A newer edit is left for the next sync.
                            if board.blacklist_set == pushed_set {
                                board.blacklist_sync = Some(now);
                            }
                        }
                    }
                    Err(reason) => {
                        t.board_mut(item.board)?.needs_check = true;
                        if let (PowerCommand::On, Some(job)) = (item.power, item.job) {
                            let entry = failed
                                .entry(job)
                                .or_insert_with(|| (reason.clone(), Vec::new()));
                            entry.1.push(item.board);
                        }
                    }
                }
            }
            Ok(failed)
        })
    }

    /// Carry out every pending power change.
    pub async fn process_pending(&self, now: DateTime<Utc>) -> Result<ProcessReport, BmpError> {
        let items = self.take_pending()?;
        let mut report = ProcessReport::default();
        if items.is_empty() {
            return Ok(report);
        }

        let mut per_bmp: BTreeMap<BmpCoords, Vec<WorkItem>> = BTreeMap::new();
        for item in items {
            per_bmp.entry(item.bmp).or_default().push(item);
        }
        let groups: Vec<(BmpCoords, Vec<WorkItem>)> = per_bmp.into_iter().collect();
        let total = groups.iter().map(|(_, items)| items.len()).sum();
        debug!(changes = total, bmps = groups.len(), "processing power changes");

        let progress = Progress::new("power", total);
        let tasks = groups.iter().map(|(bmp, items)| {
            let shared = Arc::clone(&self.shared);
            let (bmp, items, progress) = (*bmp, items.clone(), progress.clone());
            async move { shared.run_bmp(bmp, items, progress).await }
        });
        let outcomes = self.pool.submit(tasks).settle().await;

        let mut results = Vec::with_capacity(total);
        let mut requeue = Vec::new();
        for (outcome, (bmp, items)) in outcomes.into_iter().zip(groups) {
            match outcome {
                Ok(done) => results.extend(done),
                Err(TaskFailure::Failed { error, .. }) => {
                    warn!(%bmp, error = %error, "BMP failed; failing its changes");
                    let reason = error.to_string();
                    results.extend(items.into_iter().map(|item| ChangeResult {
                        item,
                        outcome: Err(reason.clone()),
                    }));
                }
                Err(failure @ TaskFailure::Panicked { .. }) => {
                    warn!(%bmp, %failure, "BMP worker died; changes will be retried");
                    requeue.extend(items);
                }
            }
        }
        self.requeue(&requeue)?;
        report.requeued = requeue.len();

        let failed = self.apply(&results, now)?;
        report.failed = results.iter().filter(|r| r.outcome.is_err()).count();
        report.applied = results.len() - report.failed;

        for (job, (reason, boards)) in failed {
            self.jobs
                .power_completed(job, PowerOutcome::Failed { reason, boards }, now)?;
            report.failed_jobs.push(job);
        }

        let touched: BTreeMap<JobId, JobState> = results
            .iter()
            .filter_map(|r| r.item.job.map(|job| (job, r.item.to_state)))
            .collect();
        for (job, to_state) in touched {
            if report.failed_jobs.contains(&job) {
                continue;
            }
            let settled = self.db.read(|t| t.changes_for_job(job).next().is_none());
            if settled && to_state != JobState::Destroyed {
                self.jobs
                    .power_completed(job, PowerOutcome::Succeeded { to_state }, now)?;
                report.completed_jobs.push(job);
            }
        }

        info!(
            applied = report.applied,
            failed = report.failed,
            requeued = report.requeued,
            "power changes processed"
        );
        Ok(report)
    }

    /// Probe every board flagged for checking on `machine`; boards that
    /// answer go back into service, the rest are marked dead.
    pub async fn recheck_boards(
        &self,
        machine: MachineId,
        _now: DateTime<Utc>,
    ) -> Result<RecheckReport, BmpError> {
        let boards = self.health.boards_needing_check(machine);
        let targets: Vec<(BoardId, BmpCoords, BmpBoard)> = self.db.read(|t| {
            boards
                .iter()
                .filter_map(|b| t.boards.get(b))
                .map(|b| (b.id, b.physical.bmp(), b.physical.bmp_board()))
                .collect()
        });

        let tasks = targets.iter().map(|(board, bmp, slot)| {
            let shared = Arc::clone(&self.shared);
            let (board, bmp, slot) = (*board, *bmp, *slot);
            async move {
                let _guard = shared.lock_board(board).await;
                let txrx = shared.txrx.as_ref();
                shared
                    .retry("read version", move || txrx.read_bmp_version(bmp, slot))
                    .await
                    .map_err(|source| BmpError::Board {
                        board,
                        operation: "read version",
                        source,
                    })?;
                let serial = shared
                    .retry("read serial", move || txrx.read_serial(bmp, slot))
                    .await
                    .map_err(|source| BmpError::Board {
                        board,
                        operation: "read serial",
                        source,
                    })?;
                Ok::<_, BmpError>(serial)
            }
        });

        let mut report = RecheckReport::default();
        for (outcome, (board, ..)) in self.pool.submit(tasks).settle().await.into_iter().zip(targets) {
            match outcome {
                Ok(serial) => {
                    self.db.transaction(|t| {
                        t.board_mut(board)?.bmp_serial = Some(serial);
                        Ok::<_, DbError>(())
                    })?;
                    self.health.mark_alive(board)?;
                    report.alive.push(board);
                }
                Err(failure) => {
                    warn!(board, %failure, "board failed re-check");
                    self.health.mark_dead(board)?;
                    report.dead.push(board);
                }
            }
        }
        Ok(report)
    }

    /// Write the stored blacklist of `board` to its serial flash.
    pub async fn push_blacklist(&self, board: BoardId, now: DateTime<Utc>) -> Result<(), BmpError> {
        let blacklist = self
            .health
            .blacklists()
            .read_blacklist(board)?
            .ok_or(BmpError::NoBlacklist { board })?;
        let (bmp, slot) = self
            .db
            .read(|t| t.board(board).map(|b| (b.physical.bmp(), b.physical.bmp_board())))?;

        let _guard = self.shared.lock_board(board).await;
        let txrx = self.shared.txrx.as_ref();
        let bl = &blacklist;
        self.shared
            .retry("write blacklist", move || txrx.write_blacklist(bmp, slot, bl))
            .await
            .map_err(|source| BmpError::Board {
                board,
                operation: "write blacklist",
                source,
            })?;
        self.health.blacklists().mark_synced(board, now)?;
        info!(board, "blacklist written to board");
        Ok(())
    }

    /// Push every stored blacklist changed since its last sync.
    pub async fn sync_blacklists(&self, now: DateTime<Utc>) -> Result<Vec<BoardId>, BmpError> {
        let stale: BTreeSet<BoardId> = self.db.read(|t| {
            t.boards
                .values()
                .filter(|b| b.blacklist_unsynced())
                .map(|b| b.id)
                .collect()
        });
        let mut pushed = Vec::new();
        for board in stale {
            match self.push_blacklist(board, now).await {
                Ok(()) => pushed.push(board),
                Err(e) => warn!(board, error = %e, "blacklist push failed"),
            }
        }
        Ok(pushed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
