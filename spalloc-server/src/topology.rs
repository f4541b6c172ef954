/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Machine topology: triad and physical board coordinates, board
//! adjacency, and toroidal wrap.
//!
//! A machine is a `width × height` grid of triads, each holding up to three
//! boards (`z = 0..depth`).  Board adjacency is derived in chip space: every
//! board root chip sits at `(12x, 12y)` plus a per-`z` offset, and each of
//! the six board-edge links leads to the board whose root is a fixed vector
//! away.
//!
//! | Direction | Root vector |
//! |---|---|
//! | east | `( 4, -4)` |
//! | north-east | `( 8,  4)` |
//! | north | `( 4,  8)` |
//! | west | `(-4,  4)` |
//! | south-west | `(-8, -4)` |
//! | south | `(-4, -8)` |
//!
//! Everything here is a pure function of the geometry and the board table.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use spalloc_comms::geometry::TRIAD_CHIP_SIZE;
use spalloc_comms::{BmpBoard, BmpCoords, ChipLocation, Direction};
use thiserror::Error;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    #[error("coordinate out of range: {0}")]
    OutOfRange(String),

    #[error("unparseable coordinates: '{0}'")]
    BadCoordinates(String),
}

// ── Coordinates ───────────────────────────────────────────────────────────────

/// Logical board coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TriadCoords {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl TriadCoords {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// Ordering key used wherever "smallest root" matters: `(z, y, x)`.
    pub fn zyx(self) -> (u32, u32, u32) {
        (self.z, self.y, self.x)
    }
}

impl fmt::Display for TriadCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[x:{},y:{},z:{}]", self.x, self.y, self.z)
    }
}

/// Physical board coordinates: cabinet, frame, slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysicalCoords {
    pub cabinet: u32,
    pub frame: u32,
    pub board: u32,
}

impl PhysicalCoords {
    pub const fn new(cabinet: u32, frame: u32, board: u32) -> Self {
        Self {
            cabinet,
            frame,
            board,
        }
    }

    /// The BMP managing this board.
    pub fn bmp(self) -> BmpCoords {
        BmpCoords::new(self.cabinet, self.frame)
    }

    pub fn bmp_board(self) -> BmpBoard {
        BmpBoard(self.board)
    }
}

impl fmt::Display for PhysicalCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[c:{},f:{},b:{}]", self.cabinet, self.frame, self.board)
    }
}

struct CoordPatterns {
    triad: Regex,
    physical: Regex,
    bmp: Regex,
}

fn patterns() -> &'static CoordPatterns {
    static PATTERNS: OnceLock<CoordPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| CoordPatterns {
        triad: Regex::new(r"^\[\s*x:\s*(\d+)\s*,\s*y:\s*(\d+)\s*,\s*z:\s*(\d+)\s*\]$")
            .expect("triad pattern"),
        physical: Regex::new(r"^\[\s*c:\s*(\d+)\s*,\s*f:\s*(\d+)\s*,\s*b:\s*(\d+)\s*\]$")
            .expect("physical pattern"),
        bmp: Regex::new(r"^\[\s*c:\s*(\d+)\s*,\s*f:\s*(\d+)\s*\]$").expect("bmp pattern"),
    })
}

/// Parse the captured integer groups of `re` matched against `s`.
fn capture_numbers<const N: usize>(re: &Regex, s: &str) -> Result<[u32; N], TopologyError> {
    let bad = || TopologyError::BadCoordinates(s.to_string());
    let caps = re.captures(s.trim()).ok_or_else(bad)?;
    let mut out = [0u32; N];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = caps[i + 1].parse().map_err(|_| bad())?;
    }
    Ok(out)
}

impl FromStr for TriadCoords {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [x, y, z] = capture_numbers::<3>(&patterns().triad, s)?;
        Ok(Self::new(x, y, z))
    }
}

impl FromStr for PhysicalCoords {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [c, f, b] = capture_numbers::<3>(&patterns().physical, s)?;
        Ok(Self::new(c, f, b))
    }
}

/// Parse `"[c:C,f:F]"`.
pub fn parse_bmp_coords(s: &str) -> Result<BmpCoords, TopologyError> {
    let [c, f] = capture_numbers::<2>(&patterns().bmp, s)?;
    Ok(BmpCoords::new(c, f))
}

// ── Geometry ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    X,
    Y,
}

/// Extent of a machine in triads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineGeometry {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    /// Whether the machine is a torus.
    pub wraps: bool,
}

impl MachineGeometry {
    /// Depth of a machine with `boards` boards: a lone board is its own
    /// triad.
    pub fn depth_for(boards: usize) -> u32 {
        if boards == 1 {
            1
        } else {
            3
        }
    }

    pub fn contains(&self, t: TriadCoords) -> bool {
        t.x < self.width && t.y < self.height && t.z < self.depth
    }

    pub fn max_boards(&self) -> u32 {
        self.width * self.height * self.depth
    }

    fn check(&self, t: TriadCoords) -> Result<(), TopologyError> {
        if self.contains(t) {
            Ok(())
        } else {
            Err(TopologyError::OutOfRange(format!(
                "{t} is outside a {}x{}x{} machine",
                self.width, self.height, self.depth
            )))
        }
    }

    fn chip_extent(&self) -> (i64, i64) {
        let size = i64::from(TRIAD_CHIP_SIZE);
        (size * i64::from(self.width), size * i64::from(self.height))
    }
}

/// Root-chip offset of board `z` within its triad.
fn z_offset(z: u32) -> (i64, i64) {
    match z {
        1 => (8, 4),
        2 => (4, 8),
        _ => (0, 0),
    }
}

fn z_from_offset(offset: (i64, i64)) -> Option<u32> {
    match offset {
        (0, 0) => Some(0),
        (8, 4) => Some(1),
        (4, 8) => Some(2),
        _ => None,
    }
}

fn direction_vector(d: Direction) -> (i64, i64) {
    match d {
        Direction::East => (4, -4),
        Direction::NorthEast => (8, 4),
        Direction::North => (4, 8),
        Direction::West => (-4, 4),
        Direction::SouthWest => (-8, -4),
        Direction::South => (-4, -8),
    }
}

fn root_chip(t: TriadCoords) -> (i64, i64) {
    let size = i64::from(TRIAD_CHIP_SIZE);
    let (dx, dy) = z_offset(t.z);
    (size * i64::from(t.x) + dx, size * i64::from(t.y) + dy)
}

/// Reduce a chip-space point to machine extent; `None` off the edge of a
/// non-wrapping machine.
fn reduce(geometry: &MachineGeometry, (x, y): (i64, i64)) -> Option<(i64, i64)> {
    let (w, h) = geometry.chip_extent();
    if geometry.wraps {
        Some((x.rem_euclid(w), y.rem_euclid(h)))
    } else if (0..w).contains(&x) && (0..h).contains(&y) {
        Some((x, y))
    } else {
        None
    }
}

/// Global location of `local` on the board at `triad`.
pub fn chip_global_location(
    geometry: &MachineGeometry,
    triad: TriadCoords,
    local: ChipLocation,
) -> Result<ChipLocation, TopologyError> {
    geometry.check(triad)?;
    if !local.is_on_board() {
        return Err(TopologyError::OutOfRange(format!(
            "chip {local} is not on a SpiNN-5 board"
        )));
    }
    let (rx, ry) = root_chip(triad);
    let point = (rx + i64::from(local.x), ry + i64::from(local.y));
    let (x, y) = reduce(geometry, point).ok_or_else(|| {
        TopologyError::OutOfRange(format!(
            "chip {local} of board {triad} falls off a non-wrapping machine"
        ))
    })?;
    Ok(ChipLocation::new(x as u32, y as u32))
}

/// Board-level neighbours of `triad`, one per live direction.  On a
/// non-wrapping machine directions leading off the edge are omitted.
pub fn neighbours(geometry: &MachineGeometry, triad: TriadCoords) -> Vec<(Direction, TriadCoords)> {
    let size = i64::from(TRIAD_CHIP_SIZE);
    let (rx, ry) = root_chip(triad);
    Direction::ALL
        .into_iter()
        .filter_map(|d| {
            let (dx, dy) = direction_vector(d);
            let (x, y) = reduce(geometry, (rx + dx, ry + dy))?;
            let z = z_from_offset((x % size, y % size))?;
            let t = TriadCoords::new((x / size) as u32, (y / size) as u32, z);
            geometry.contains(t).then_some((d, t))
        })
        .collect()
}

/// Distance between two coordinates along `dimension`, the short way round
/// on a torus.
pub fn wrap_distance(
    geometry: &MachineGeometry,
    a: u32,
    b: u32,
    dimension: Dimension,
) -> Result<u32, TopologyError> {
    let size = match dimension {
        Dimension::X => geometry.width,
        Dimension::Y => geometry.height,
    };
    if a >= size || b >= size {
        return Err(TopologyError::OutOfRange(format!(
            "{dimension:?} coordinate {} exceeds extent {size}",
            a.max(b)
        )));
    }
    let d = a.abs_diff(b);
    Ok(if geometry.wraps { d.min(size - d) } else { d })
}

/// Triads of the `width × height × depth` block rooted at `root`.
pub fn block_members(
    geometry: &MachineGeometry,
    root: TriadCoords,
    width: u32,
    height: u32,
    depth: u32,
) -> Result<Vec<TriadCoords>, TopologyError> {
    geometry.check(root)?;
    if width > geometry.width || height > geometry.height || root.z + depth > geometry.depth {
        return Err(TopologyError::OutOfRange(format!(
            "{width}x{height}x{depth} block at {root} is larger than the machine"
        )));
    }
    let mut members = Vec::with_capacity((width * height * depth) as usize);
    for dz in 0..depth {
        for dy in 0..height {
            for dx in 0..width {
                let (x, y) = (root.x + dx, root.y + dy);
                let t = if geometry.wraps {
                    TriadCoords::new(x % geometry.width, y % geometry.height, root.z + dz)
                } else {
                    TriadCoords::new(x, y, root.z + dz)
                };
                geometry.check(t)?;
                members.push(t);
            }
        }
    }
    Ok(members)
}

// ── Board table ───────────────────────────────────────────────────────────────

/// The machine's triad ↔ physical board table.
#[derive(Debug, Clone)]
pub struct MachineLayout {
    pub geometry: MachineGeometry,
    by_triad: BTreeMap<TriadCoords, PhysicalCoords>,
    by_physical: BTreeMap<PhysicalCoords, TriadCoords>,
}

impl MachineLayout {
    pub fn new(geometry: MachineGeometry) -> Self {
        Self {
            geometry,
            by_triad: BTreeMap::new(),
            by_physical: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, triad: TriadCoords, physical: PhysicalCoords) -> Result<(), TopologyError> {
        self.geometry.check(triad)?;
        self.by_triad.insert(triad, physical);
        self.by_physical.insert(physical, triad);
        Ok(())
    }

    pub fn triad_to_physical(&self, triad: TriadCoords) -> Result<PhysicalCoords, TopologyError> {
        self.geometry.check(triad)?;
        self.by_triad
            .get(&triad)
            .copied()
            .ok_or_else(|| TopologyError::OutOfRange(format!("no board at {triad}")))
    }

    pub fn physical_to_triad(&self, physical: PhysicalCoords) -> Result<TriadCoords, TopologyError> {
        self.by_physical
            .get(&physical)
            .copied()
            .ok_or_else(|| TopologyError::OutOfRange(format!("no board at {physical}")))
    }

    pub fn len(&self) -> usize {
        self.by_triad.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_triad.is_empty()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(width: u32, height: u32, wraps: bool) -> MachineGeometry {
        MachineGeometry {
            width,
            height,
            depth: 3,
            wraps,
        }
    }

    // ── Coordinates ───────────────────────────────────────────────────────────

    #[test]
    fn coordinate_strings_parse_and_print() {
        let t: TriadCoords = "[x:1,y:2,z:0]".parse().unwrap();
        assert_eq!(t, TriadCoords::new(1, 2, 0));
        assert_eq!(t.to_string(), "[x:1,y:2,z:0]");

        let p: PhysicalCoords = "[c: 0, f: 1, b: 23]".parse().unwrap();
        assert_eq!(p, PhysicalCoords::new(0, 1, 23));
        assert_eq!(p.bmp(), BmpCoords::new(0, 1));

        assert_eq!(parse_bmp_coords("[c:3,f:4]").unwrap(), BmpCoords::new(3, 4));
        assert!(matches!(
            "[x:1,y:2]".parse::<TriadCoords>(),
            Err(TopologyError::BadCoordinates(_))
        ));
    }

    #[test]
    fn layout_maps_both_ways_and_bounds_checks() {
        let mut layout = MachineLayout::new(geometry(2, 2, false));
        let t = TriadCoords::new(1, 0, 2);
        let p = PhysicalCoords::new(0, 0, 5);
        layout.insert(t, p).unwrap();

        assert_eq!(layout.triad_to_physical(t).unwrap(), p);
        assert_eq!(layout.physical_to_triad(p).unwrap(), t);
        assert!(matches!(
            layout.triad_to_physical(TriadCoords::new(2, 0, 0)),
            Err(TopologyError::OutOfRange(_))
        ));
        assert!(layout.triad_to_physical(TriadCoords::new(0, 0, 0)).is_err());
        assert!(layout.physical_to_triad(PhysicalCoords::new(0, 0, 6)).is_err());
        assert!(layout.insert(TriadCoords::new(0, 0, 3), p).is_err());
    }

    // ── Chip locations ────────────────────────────────────────────────────────

    #[test]
    fn chip_locations_follow_triad_offsets() {
        let g = geometry(2, 2, false);
        let origin = ChipLocation::new(0, 0);
        let loc = |x, y, z| chip_global_location(&g, TriadCoords::new(x, y, z), origin).unwrap();
        assert_eq!(loc(0, 0, 0), ChipLocation::new(0, 0));
        assert_eq!(loc(0, 0, 1), ChipLocation::new(8, 4));
        assert_eq!(loc(0, 0, 2), ChipLocation::new(4, 8));
        assert_eq!(loc(1, 1, 0), ChipLocation::new(12, 12));
    }

    #[test]
    fn chip_locations_wrap_only_on_a_torus() {
        let top = ChipLocation::new(7, 7);
        let t = TriadCoords::new(1, 1, 1);
        assert_eq!(
            chip_global_location(&geometry(2, 2, true), t, top).unwrap(),
            ChipLocation::new(3, 23)
        );
        assert!(matches!(
            chip_global_location(&geometry(2, 2, false), t, top),
            Err(TopologyError::OutOfRange(_))
        ));
        // (0, 7) is not one of the 48 chips
        assert!(chip_global_location(&geometry(2, 2, true), t, ChipLocation::new(0, 7)).is_err());
    }

    // ── Neighbours ────────────────────────────────────────────────────────────

    #[test]
    fn interior_board_has_six_neighbours() {
        let g = geometry(3, 3, false);
        let n = neighbours(&g, TriadCoords::new(1, 1, 0));
        assert_eq!(n.len(), 6);
        let find = |d| n.iter().find(|(dir, _)| *dir == d).map(|(_, t)| *t);
        assert_eq!(find(Direction::NorthEast), Some(TriadCoords::new(1, 1, 1)));
        assert_eq!(find(Direction::North), Some(TriadCoords::new(1, 1, 2)));
        assert_eq!(find(Direction::East), Some(TriadCoords::new(1, 0, 2)));
        assert_eq!(find(Direction::West), Some(TriadCoords::new(0, 1, 1)));
        assert_eq!(find(Direction::SouthWest), Some(TriadCoords::new(0, 0, 2)));
        assert_eq!(find(Direction::South), Some(TriadCoords::new(0, 0, 1)));
    }

    #[test]
    fn neighbour_relation_is_symmetric() {
        for wraps in [false, true] {
            let g = geometry(3, 2, wraps);
            for x in 0..3 {
                for y in 0..2 {
                    for z in 0..3 {
                        let t = TriadCoords::new(x, y, z);
                        for (d, n) in neighbours(&g, t) {
                            assert!(
                                neighbours(&g, n).contains(&(d.opposite(), t)),
                                "{t} -{d}-> {n} has no way back"
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn edges_are_hard_without_wrap() {
        let g = geometry(2, 2, false);
        let n = neighbours(&g, TriadCoords::new(0, 0, 0));
        assert_eq!(n.len(), 2); // only the triad's own z1 and z2
        let torus = geometry(2, 2, true);
        assert_eq!(neighbours(&torus, TriadCoords::new(0, 0, 0)).len(), 6);
    }

    #[test]
    fn wrap_distance_takes_short_way_round_on_torus() {
        let flat = geometry(8, 4, false);
        let torus = geometry(8, 4, true);
        assert_eq!(wrap_distance(&flat, 0, 7, Dimension::X).unwrap(), 7);
        assert_eq!(wrap_distance(&torus, 0, 7, Dimension::X).unwrap(), 1);
        assert_eq!(wrap_distance(&torus, 1, 3, Dimension::Y).unwrap(), 2);
        assert!(matches!(
            wrap_distance(&torus, 0, 4, Dimension::Y),
            Err(TopologyError::OutOfRange(_))
        ));
    }

    // ── Blocks ────────────────────────────────────────────────────────────────

    #[test]
    fn block_members_wrap_on_torus_only() {
        let root = TriadCoords::new(1, 0, 0);
        let members = block_members(&geometry(2, 2, true), root, 2, 1, 3).unwrap();
        assert_eq!(members.len(), 6);
        assert!(members.contains(&TriadCoords::new(0, 0, 2)));
        assert!(block_members(&geometry(2, 2, false), root, 2, 1, 3).is_err());
        assert!(block_members(&geometry(2, 2, true), root, 3, 1, 3).is_err());
    }

    #[test]
    fn single_board_machine_has_depth_one() {
        assert_eq!(MachineGeometry::depth_for(1), 1);
        assert_eq!(MachineGeometry::depth_for(24), 3);
    }
}
