/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Machine definitions.
//!
//! ```json
//! {
//!   "machines": [{
//!     "name": "my-board",
//!     "tags": ["default"],
//!     "width": 1, "height": 1, "wraps": false,
//!     "dead-boards": ["[x:0,y:0,z:2]"],
//!     "dead-links": {"[x:0,y:0,z:0]": ["north", "east"]},
//!     "board-locations": {"[x:0,y:0,z:0]": "[c:0,f:0,b:0]"},
//!     "bmp-ips": {"[c:0,f:0]": "10.11.12.1"},
//!     "spinnaker-ips": {"[x:0,y:0,z:0]": "10.11.12.2"}
//!   }]
//! }
//! ```
//!
//! Dead boards are installed out of service; those without a location of
//! their own borrow the location of the root board.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use serde::Deserialize;
use spalloc_comms::{BmpCoords, Direction};
use tracing::{debug, info};

use crate::db::{MachineId, Tables};
use crate::topology::{
    parse_bmp_coords, MachineGeometry, MachineLayout, PhysicalCoords, TriadCoords,
};

// ── Private JSON types ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct MachinesFile {
    machines: Vec<MachineEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MachineEntry {
    name: String,
    #[serde(default)]
    tags: BTreeSet<String>,
    width: u32,
    height: u32,
    #[serde(default)]
    wraps: bool,
    #[serde(default)]
    dead_boards: Vec<String>,
    #[serde(default)]
    dead_links: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    board_locations: BTreeMap<String, String>,
    #[serde(default)]
    bmp_ips: BTreeMap<String, IpAddr>,
    #[serde(default)]
    spinnaker_ips: BTreeMap<String, IpAddr>,
}

// ── MachineDefinition ─────────────────────────────────────────────────────────

/// A validated machine definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineDefinition {
    pub name: String,
    pub tags: BTreeSet<String>,
    pub geometry: MachineGeometry,
    pub dead_boards: BTreeSet<TriadCoords>,
    pub dead_links: BTreeMap<TriadCoords, BTreeSet<Direction>>,
    pub board_locations: BTreeMap<TriadCoords, PhysicalCoords>,
    pub bmp_ips: BTreeMap<BmpCoords, IpAddr>,
    pub spinnaker_ips: BTreeMap<TriadCoords, IpAddr>,
}

fn bad_name(name: &str) -> bool {
    name.is_empty()
        || name.contains(['{', '}', '\0'])
        || name.chars().any(char::is_whitespace)
}

fn triad(s: &str) -> Result<TriadCoords> {
    s.parse().with_context(|| format!("bad board coordinates '{s}'"))
}

impl MachineDefinition {
    fn from_entry(entry: MachineEntry) -> Result<Self> {
        let name = entry.name;
        ensure!(
            !bad_name(&name),
            "machine name '{name}' must be non-empty and free of braces or spaces"
        );
        if let Some(tag) = entry.tags.iter().find(|t| bad_name(t)) {
            bail!("tag '{tag}' must be non-empty and free of braces or spaces");
        }
        ensure!(
            entry.width > 0 && entry.height > 0,
            "machine size {}x{} must be positive",
            entry.width,
            entry.height
        );

        let board_locations = entry
            .board_locations
            .iter()
            .map(|(t, p)| {
                let physical: PhysicalCoords = p
                    .parse()
                    .with_context(|| format!("bad physical coordinates '{p}'"))?;
                Ok((triad(t)?, physical))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let dead_boards = entry
            .dead_boards
            .iter()
            .map(|t| triad(t))
            .collect::<Result<BTreeSet<_>>>()?;
        let dead_links = entry
            .dead_links
            .iter()
            .map(|(t, names)| {
                let dirs = names
                    .iter()
                    .map(|n| {
                        Direction::from_name(n).ok_or_else(|| anyhow!("unknown link direction '{n}'"))
                    })
                    .collect::<Result<BTreeSet<_>>>()?;
                Ok((triad(t)?, dirs))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let bmp_ips = entry
            .bmp_ips
            .iter()
            .map(|(b, ip)| {
                let coords =
                    parse_bmp_coords(b).with_context(|| format!("bad BMP coordinates '{b}'"))?;
                Ok((coords, *ip))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;
        let spinnaker_ips = entry
            .spinnaker_ips
            .iter()
            .map(|(t, ip)| Ok((triad(t)?, *ip)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        let geometry = MachineGeometry {
            width: entry.width,
            height: entry.height,
            depth: MachineGeometry::depth_for(board_locations.len() + dead_boards.len()),
            wraps: entry.wraps,
        };

        let def = Self {
            name,
            tags: entry.tags,
            geometry,
            dead_boards,
            dead_links,
            board_locations,
            bmp_ips,
            spinnaker_ips,
        };
        def.validate()?;
        Ok(def)
    }

    fn validate(&self) -> Result<()> {
        let name = &self.name;
        for t in self
            .board_locations
            .keys()
            .chain(&self.dead_boards)
            .chain(self.dead_links.keys())
        {
            ensure!(
                self.geometry.contains(*t),
                "{name}: board {t} lies outside the machine"
            );
        }
        for (t, physical) in &self.board_locations {
            ensure!(
                self.spinnaker_ips.contains_key(t),
                "{name}: board {t} has no address"
            );
            ensure!(
                self.bmp_ips.contains_key(&physical.bmp()),
                "{name}: board {t} has no BMP at {}",
                physical.bmp()
            );
        }
        if let Some(t) = self
            .spinnaker_ips
            .keys()
            .find(|t| !self.board_locations.contains_key(t))
        {
            bail!("{name}: address given for unknown board {t}");
        }
        if let Some(t) = self
            .dead_boards
            .iter()
            .find(|t| !self.board_locations.contains_key(t))
        {
            ensure!(
                self.board_locations.contains_key(&TriadCoords::default()),
                "{name}: dead board {t} has no location and there is no root board"
            );
        }
        Ok(())
    }

    /// Add this machine, its boards and its dead links to the tables.
    pub fn install(&self, t: &mut Tables) -> Result<MachineId> {
        let mut layout = MachineLayout::new(self.geometry);
        for (triad, physical) in &self.board_locations {
            layout.insert(*triad, *physical)?;
        }
        let machine = t
            .add_machine(&self.name, self.tags.clone(), layout, self.bmp_ips.clone())
            .with_context(|| format!("installing machine '{}'", self.name))?;

        let root = self.board_locations.get(&TriadCoords::default()).copied();
        let triads: BTreeSet<TriadCoords> = self
            .board_locations
            .keys()
            .chain(&self.dead_boards)
            .copied()
            .collect();
        for triad in triads {
            let live = !self.dead_boards.contains(&triad);
            let physical = self
                .board_locations
                .get(&triad)
                .copied()
                .or(root)
                .ok_or_else(|| anyhow!("{}: no location for board {triad}", self.name))?;
            let address = if live {
                self.spinnaker_ips.get(&triad).copied()
            } else {
                None
            };
            let board = t.add_board(machine, triad, physical, address, live)?;
            debug!(machine = %self.name, %triad, live, "board installed");

            for direction in self.dead_links.get(&triad).into_iter().flatten() {
                t.add_dead_link(board, *direction)?;
            }
        }
        info!(
            machine = %self.name,
            boards = self.board_locations.len(),
            dead = self.dead_boards.len(),
            "machine installed"
        );
        Ok(machine)
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parse and validate a machine-definition document.
pub fn parse_machines(json: &str) -> Result<Vec<MachineDefinition>> {
    let file: MachinesFile = serde_json::from_str(json).context("Failed to parse machine JSON")?;
    let mut seen = BTreeSet::new();
    file.machines
        .into_iter()
        .map(|entry| {
            let def = MachineDefinition::from_entry(entry)?;
            ensure!(seen.insert(def.name.clone()), "machine '{}' defined twice", def.name);
            Ok(def)
        })
        .collect()
}

/// Read and validate the machine definitions at `path`.
pub fn load_machines(path: &Path) -> Result<Vec<MachineDefinition>> {
    info!("Loading machine definitions from: {}", path.display());
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot open machine definitions: {}", path.display()))?;
    let machines = parse_machines(&content)
        .with_context(|| format!("Invalid machine definitions in {}", path.display()))?;
    info!("Loaded {} machine definition(s)", machines.len());
    Ok(machines)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
