/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The allocator daemon: one store, the managers over it, and the timers
//! that drive them.
//!
//! | Timer | Work |
//! |---|---|
//! | `keepalive_sweep_secs` | destroy lapsed and overdrawn jobs |
//! | `allocation_period_secs` | one allocation round |
//! | `bmp_period_secs` | drain pending power changes |
//! | `recheck_period_secs` | re-probe flagged boards, push stale blacklists |
//! | `consolidation_period_secs` | charge destroyed jobs to their groups |

use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use spalloc_comms::scp::SCP_SCAMP_PORT;
use spalloc_comms::{BmpCoords, BmpTransceiver};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::allocator::quota::QuotaManager;
use crate::bmp::{BmpController, ProcessReport};
use crate::config::machine::MachineDefinition;
use crate::config::AllocatorConfig;
use crate::db::{Database, MachineId, Tables};
use crate::jobs::{AllocationRound, JobManager};

/// UDP endpoints of every BMP of `machines`.
///
/// BMPs are addressed by cabinet and frame alone, so two machines may not
/// both use the same coordinates.
pub fn bmp_endpoints(machines: &[MachineDefinition]) -> Result<Vec<(BmpCoords, SocketAddr)>> {
    let mut owners: BTreeMap<BmpCoords, (&str, SocketAddr)> = BTreeMap::new();
    for m in machines {
        for (coords, ip) in &m.bmp_ips {
            let addr = SocketAddr::new(*ip, SCP_SCAMP_PORT);
            if let Some((other, _)) = owners.insert(*coords, (m.name.as_str(), addr)) {
                bail!("BMP {coords} is claimed by both '{other}' and '{}'", m.name);
            }
        }
    }
    Ok(owners.into_iter().map(|(c, (_, addr))| (c, addr)).collect())
}

fn ticker(secs: u64) -> Interval {
    let mut t = interval(Duration::from_secs(secs));
    t.set_missed_tick_behavior(MissedTickBehavior::Skip);
    t
}

// ── Allocator ─────────────────────────────────────────────────────────────────

pub struct Allocator {
    config: AllocatorConfig,
    db: Arc<Database>,
    jobs: JobManager,
    quota: QuotaManager,
    bmp: BmpController,
}

impl Allocator {
    /// Install `machines` into a fresh store and wire up the managers.
    pub fn new(
        config: AllocatorConfig,
        machines: &[MachineDefinition],
        txrx: Arc<dyn BmpTransceiver>,
    ) -> Result<Self> {
        let mut tables = Tables::new();
        for m in machines {
            m.install(&mut tables)
                .with_context(|| format!("Cannot install machine '{}'", m.name))?;
        }
        let db = Arc::new(Database::new(tables));
        let jobs = JobManager::new(Arc::clone(&db), config.job_policy());
        let bmp = BmpController::new(Arc::clone(&db), jobs.clone(), txrx, config.bmp_settings());
        Ok(Self {
            quota: QuotaManager::new(Arc::clone(&db)),
            config,
            db,
            jobs,
            bmp,
        })
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn quota(&self) -> &QuotaManager {
        &self.quota
    }

    pub fn bmp(&self) -> &BmpController {
        &self.bmp
    }

    // ── Timer work ────────────────────────────────────────────────────────────

    pub fn sweep(&self, now: DateTime<Utc>) {
        let destroyed = self.jobs.expire_jobs(now);
        if !destroyed.is_empty() {
            info!(jobs = ?destroyed, "expired jobs destroyed");
        }
    }

    pub fn allocate(&self, now: DateTime<Utc>) -> AllocationRound {
        let round = self.jobs.allocate_queued(now);
        if !round.allocated.is_empty() {
            info!(jobs = ?round.allocated, "jobs allocated");
        }
        round
    }

    pub async fn drive_bmps(&self, now: DateTime<Utc>) -> Option<ProcessReport> {
        match self.bmp.process_pending(now).await {
            Ok(report) => Some(report),
            Err(e) => {
                error!(error = %e, "power round failed");
                None
            }
        }
    }

    pub async fn maintain(&self, now: DateTime<Utc>) {
        let machines: Vec<MachineId> = self.db.read(|t| t.machines.keys().copied().collect());
        for machine in machines {
            match self.bmp.recheck_boards(machine, now).await {
                Ok(report) if !report.dead.is_empty() => {
                    warn!(machine, dead = ?report.dead, "boards taken out of service");
                }
                Ok(_) => {}
                Err(e) => error!(machine, error = %e, "board re-check failed"),
            }
        }
        if let Err(e) = self.bmp.sync_blacklists(now).await {
            error!(error = %e, "blacklist sync failed");
        }
    }

    pub fn consolidate(&self, now: DateTime<Utc>) -> usize {
        self.quota.consolidate(now)
    }

    /// Run every timer until `shutdown` resolves, then drain outstanding
    /// power changes once more so that power-offs reach the boards.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let cfg = &self.config;
        let mut expire = ticker(cfg.keepalive_sweep_secs);
        let mut allocate = ticker(cfg.allocation_period_secs);
        let mut power = ticker(cfg.bmp_period_secs);
        let mut recheck = ticker(cfg.recheck_period_secs);
        let mut consolidate = ticker(cfg.consolidation_period_secs);
        tokio::pin!(shutdown);

        info!("allocator running");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = expire.tick() => self.sweep(Utc::now()),
                _ = allocate.tick() => {
                    self.allocate(Utc::now());
                }
                _ = power.tick() => {
                    self.drive_bmps(Utc::now()).await;
                }
                _ = recheck.tick() => self.maintain(Utc::now()).await,
                _ = consolidate.tick() => {
                    let charged = self.consolidate(Utc::now());
                    debug!(jobs = charged, "consolidation tick");
                }
            }
        }

        info!("allocator shutting down");
        self.drive_bmps(Utc::now()).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use spalloc_comms::transceiver::mock::MockBmpTransceiver;

    use super::*;
    use crate::allocator::{AllocationRequest, AllocationShape};
    use crate::config::machine::parse_machines;
    use crate::db::{DbError, GroupType};
    use crate::jobs::{CreateJob, JobState};

    const MACHINE: &str = r#"{"machines": [{
        "name": "spin5",
        "width": 1, "height": 1,
        "board-locations": {
            "[x:0,y:0,z:0]": "[c:0,f:0,b:0]",
            "[x:0,y:0,z:1]": "[c:0,f:0,b:1]",
            "[x:0,y:0,z:2]": "[c:0,f:0,b:2]"
        },
        "bmp-ips": {"[c:0,f:0]": "10.0.0.1"},
        "spinnaker-ips": {
            "[x:0,y:0,z:0]": "10.0.0.2",
            "[x:0,y:0,z:1]": "10.0.0.3",
            "[x:0,y:0,z:2]": "10.0.0.4"
        }
    }]}"#;

    fn allocator() -> (Allocator, Arc<MockBmpTransceiver>) {
        let machines = parse_machines(MACHINE).unwrap();
        let mock = Arc::new(MockBmpTransceiver::new());
        let txrx: Arc<dyn BmpTransceiver> = Arc::clone(&mock) as Arc<dyn BmpTransceiver>;
        let a = Allocator::new(AllocatorConfig::default(), &machines, txrx).unwrap();
        (a, mock)
    }

    #[tokio::test]
    async fn job_runs_from_queue_to_powered_off() {
        let (a, mock) = allocator();
        let (user, group) = a
            .db()
            .transaction(|t| {
                let u = t.add_user("alice", None);
                let g = t.add_group("alice", GroupType::Internal, Some(1_000_000));
                t.add_membership(u, g)?;
                Ok::<_, DbError>((u, g))
            })
            .unwrap();

        let now = Utc::now();
        let job = a
            .jobs()
            .create_job(
                CreateJob {
                    machine: None,
                    tags: BTreeSet::new(),
                    owner: user,
                    group,
                    request: AllocationRequest {
                        shape: AllocationShape::NumBoards(3),
                        max_dead_boards: 0,
                    },
                    keepalive_interval: None,
                    original_request: Vec::new(),
                },
                now,
            )
            .unwrap();

        assert_eq!(a.allocate(now).allocated, vec![job]);
        a.drive_bmps(now).await.unwrap();
        assert_eq!(a.jobs().job(job).unwrap().state, JobState::Ready);
        assert_eq!(mock.powered_boards().len(), 3);

        let later = now + chrono::Duration::seconds(120);
        a.sweep(later);
        a.drive_bmps(later).await.unwrap();
        assert_eq!(a.jobs().job(job).unwrap().state, JobState::Destroyed);
        assert!(mock.powered_boards().is_empty());
        assert_eq!(a.consolidate(later), 0);
        assert!(a.jobs().job(job).unwrap().accounted_for);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (a, _) = allocator();
        tokio::time::timeout(Duration::from_secs(5), a.run(async {}))
            .await
            .unwrap();
    }

    #[test]
    fn shared_bmp_coordinates_are_rejected() {
        let mut machines = parse_machines(MACHINE).unwrap();
        let mut twin = machines[0].clone();
        twin.name = "twin".into();
        machines.push(twin);
        assert!(bmp_endpoints(&machines).is_err());

        machines.pop();
        let endpoints = bmp_endpoints(&machines).unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].1.port(), SCP_SCAMP_PORT);
    }
}
