/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Rectangle estimate for a board-count request.

use crate::topology::MachineGeometry;

use super::AllocationError;

/// The smallest near-square block that holds `boards` boards, and how many
/// of its positions may be missing without dropping below the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionEstimate {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub tolerance: u32,
}

impl DimensionEstimate {
    pub fn for_boards(boards: u32, geometry: &MachineGeometry) -> Result<Self, AllocationError> {
        if boards == 0 {
            return Err(AllocationError::InvalidShape(
                "board count must be positive".into(),
            ));
        }
        let depth = geometry.depth.max(1);
        let units = boards.div_ceil(depth);
        let width = ceil_sqrt(units).min(geometry.width);
        let height = units.div_ceil(width.max(1)).min(geometry.height);
        let capacity = width * height * depth;
        if capacity < boards {
            return Err(AllocationError::InvalidShape(format!(
                "{boards} boards do not fit a {}x{}x{} machine",
                geometry.width, geometry.height, geometry.depth
            )));
        }
        Ok(Self {
            width,
            height,
            depth,
            tolerance: capacity - boards,
        })
    }

    pub fn size(&self) -> u32 {
        self.width * self.height * self.depth
    }
}

fn ceil_sqrt(n: u32) -> u32 {
    let mut r = (f64::from(n)).sqrt() as u32;
    while r * r < n {
        r += 1;
    }
    r
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn geom(width: u32, height: u32) -> MachineGeometry {
        MachineGeometry {
            width,
            height,
            depth: 3,
            wraps: false,
        }
    }

    #[test]
    fn nine_boards_is_a_column_of_three_triads() {
        let e = DimensionEstimate::for_boards(9, &geom(4, 4)).unwrap();
        assert_eq!((e.width, e.height, e.depth, e.tolerance), (2, 2, 3, 3));
    }

    #[test]
    fn exact_fits_have_no_tolerance() {
        let e = DimensionEstimate::for_boards(12, &geom(4, 4)).unwrap();
        assert_eq!((e.width, e.height, e.tolerance), (2, 2, 0));
        assert_eq!(e.size(), 12);
    }

    #[test]
    fn narrow_machine_clamps_width() {
        let e = DimensionEstimate::for_boards(18, &geom(1, 8)).unwrap();
        assert_eq!((e.width, e.height, e.tolerance), (1, 6, 0));
    }

    #[test]
    fn zero_or_oversized_counts_are_invalid() {
        assert!(matches!(
            DimensionEstimate::for_boards(0, &geom(2, 2)),
            Err(AllocationError::InvalidShape(_))
        ));
        assert!(matches!(
            DimensionEstimate::for_boards(13, &geom(2, 2)),
            Err(AllocationError::InvalidShape(_))
        ));
    }
}
