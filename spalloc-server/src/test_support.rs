/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Fixtures shared by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr};

use crate::db::{GroupId, GroupType, MachineId, Tables, UserId};
use crate::topology::{MachineGeometry, MachineLayout, PhysicalCoords, TriadCoords};

/// Boards per BMP frame.
const FRAME_BOARDS: u32 = 24;

/// A fully populated `width × height` machine (depth 3) named `"m"`.
///
/// Boards are numbered x, y, z-major into frames of 24 in cabinet 0; board
/// `n` sits at `10.11.(n/256).(n%256)` and frame `f`'s BMP at `10.12.0.f`.
pub fn machine(width: u32, height: u32, wraps: bool) -> (Tables, MachineId) {
    let geometry = MachineGeometry {
        width,
        height,
        depth: 3,
        wraps,
    };
    let mut placements = Vec::new();
    let mut n = 0u32;
    for x in 0..width {
        for y in 0..height {
            for z in 0..3 {
                let physical = PhysicalCoords::new(0, n / FRAME_BOARDS, n % FRAME_BOARDS);
                let ip = IpAddr::V4(Ipv4Addr::new(10, 11, (n / 256) as u8, (n % 256) as u8));
                placements.push((TriadCoords::new(x, y, z), physical, ip));
                n += 1;
            }
        }
    }

    let mut layout = MachineLayout::new(geometry);
    let mut bmps = BTreeMap::new();
    for (triad, physical, _) in &placements {
        layout.insert(*triad, *physical).unwrap();
        bmps.insert(
            physical.bmp(),
            IpAddr::V4(Ipv4Addr::new(10, 12, 0, physical.frame as u8)),
        );
    }

    let mut tables = Tables::new();
    let m = tables
        .add_machine("m", BTreeSet::new(), layout, bmps)
        .unwrap();
    for (triad, physical, ip) in placements {
        tables.add_board(m, triad, physical, Some(ip), true).unwrap();
    }
    (tables, m)
}

/// An internal group with `quota` and one member.
pub fn group_with_user(tables: &mut Tables, quota: Option<i64>) -> (GroupId, UserId) {
    let g = tables.add_group("g", GroupType::Internal, quota);
    let u = tables.add_user("u", None);
    tables.add_membership(u, g).unwrap();
    (g, u)
}
