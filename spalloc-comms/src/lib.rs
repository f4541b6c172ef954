/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! spalloc-comms – talking to SpiNNaker boards and their BMPs
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── geometry        – SpiNN-5 on-board chip layout, link directions
//! ├── blacklist/      – dead chip/core/link model, text + binary codecs
//! ├── scp             – SDP/SCP packet framing and result codes
//! ├── error           – CommsError taxonomy
//! ├── transceiver/    – BmpTransceiver trait, UDP implementation, mock
//! └── fast_data_in    – sequence-numbered bulk upload with gap retransmission
//! ```

pub mod blacklist;
pub mod error;
pub mod fast_data_in;
pub mod geometry;
pub mod scp;
pub mod transceiver;

pub use blacklist::{Blacklist, BlacklistError};
pub use error::CommsError;
pub use geometry::{ChipLocation, Direction};
pub use transceiver::{BmpBoard, BmpCoords, BmpTransceiver, BmpVersion, PowerCommand};
