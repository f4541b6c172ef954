/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! spalloc-server – SpiNNaker board allocator
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── topology        – triad / physical coordinates, adjacency, wrap
//! ├── db/             – in-memory tables, transactions, groups, blacklists
//! ├── health          – board and link usability, re-check flags
//! ├── allocator/      – region search, reservation, estimates, quotas
//! ├── jobs/           – job state machine and lifecycle transitions
//! ├── bmp/            – pending power changes onto the BMPs
//! ├── executor        – bounded worker pool, failure aggregation
//! ├── config/         – YAML service config, JSON machine definitions
//! └── service         – the daemon's timers
//! ```

pub mod allocator;
pub mod bmp;
pub mod config;
pub mod db;
pub mod executor;
pub mod health;
pub mod jobs;
pub mod service;
pub mod topology;

#[cfg(test)]
mod test_support;
