/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Human-readable blacklist format.
//!
//! ```text
//! # comment
//! chip 0 0 core 2 link 3
//! chip 5 5 dead
//! chip 4 0 link 0,5 core 1,16
//! ```
//!
//! Each line names a board-local chip followed by at least one and at most
//! one each of the `core`, `link` and `dead` clauses, in any order.  Errors carry the offending
//! line verbatim.  Parsing stops at the first bad line.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use super::{Blacklist, BlacklistError};
use crate::geometry::{board_chips, ChipLocation, Direction, MAX_NUM_CORES};

// ── Grammar ───────────────────────────────────────────────────────────────────

struct Grammar {
    chip: Regex,
    core: Regex,
    link: Regex,
    dead: Regex,
}

fn grammar() -> &'static Grammar {
    static GRAMMAR: OnceLock<Grammar> = OnceLock::new();
    GRAMMAR.get_or_init(|| Grammar {
        chip: Regex::new(r"^\s*chip\s+([0-7])\s+([0-7])\s*").expect("chip pattern"),
        core: Regex::new(r"^core\s+(\S+)\s*").expect("core pattern"),
        link: Regex::new(r"^link\s+(\S+)\s*").expect("link pattern"),
        dead: Regex::new(r"^dead\s*").expect("dead pattern"),
    })
}

// ── Parsing ───────────────────────────────────────────────────────────────────

impl Blacklist {
    /// Parse the text format.
    ///
    /// # Errors
    /// The first bad line stops the parse:
    /// * [`BlacklistError::BadLine`] – grammar violation
    /// * [`BlacklistError::BadChipCoords`] – chip not on the board
    /// * [`BlacklistError::BadCoreNumber`] – core outside `0..=17`
    /// * [`BlacklistError::LinkIndexOutOfRange`] – link outside `0..=5`
    pub fn parse(text: &str) -> Result<Self, BlacklistError> {
        let mut bl = Blacklist::new();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            parse_line(line, &mut bl)?;
        }
        Ok(bl)
    }

    /// Render in the text format: one line per affected chip, x-major.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for chip in board_chips() {
            if self.is_chip_dead(chip) {
                out.push_str(&format!("chip {} {} dead\n", chip.x, chip.y));
                continue;
            }
            let cores = self.dead_cores().get(&chip);
            let links = self.dead_links().get(&chip);
            if cores.is_none() && links.is_none() {
                continue;
            }
            out.push_str(&format!("chip {} {}", chip.x, chip.y));
            if let Some(cores) = cores {
                out.push_str(" core ");
                out.push_str(&join(cores.iter().map(u32::to_string)));
            }
            if let Some(links) = links {
                out.push_str(" link ");
                out.push_str(&join(links.iter().map(|d| d.id().to_string())));
            }
            out.push('\n');
        }
        out
    }
}

impl FromStr for Blacklist {
    type Err = BlacklistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Blacklist::parse(s)
    }
}

impl fmt::Display for Blacklist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn join(items: impl Iterator<Item = String>) -> String {
    items.collect::<Vec<_>>().join(",")
}

/// Parse one non-blank, non-comment line into `bl`.
fn parse_line(line: &str, bl: &mut Blacklist) -> Result<(), BlacklistError> {
    let g = grammar();
    let bad_line = || BlacklistError::BadLine(line.to_string());

    let caps = g.chip.captures(line).ok_or_else(bad_line)?;
    let mut rest = &line[caps[0].len()..];
    if rest.is_empty() {
        return Err(bad_line());
    }
    let x: u32 = caps[1].parse().map_err(|_| bad_line())?;
    let y: u32 = caps[2].parse().map_err(|_| bad_line())?;
    let chip = ChipLocation::new(x, y);
    if !chip.is_on_board() {
        return Err(BlacklistError::BadChipCoords(line.to_string()));
    }

    let mut cores: Option<Vec<u32>> = None;
    let mut links: Option<Vec<Direction>> = None;
    let mut dead = false;

    while !rest.is_empty() {
        if let Some(c) = g.core.captures(rest) {
            if cores.is_some() {
                return Err(bad_line());
            }
            let mut parsed = Vec::new();
            for n in split_numbers(&c[1], line)? {
                if n >= MAX_NUM_CORES {
                    return Err(BlacklistError::BadCoreNumber(line.to_string()));
                }
                parsed.push(n);
            }
            cores = Some(parsed);
            rest = &rest[c[0].len()..];
        } else if let Some(c) = g.link.captures(rest) {
            if links.is_some() {
                return Err(bad_line());
            }
            let mut parsed = Vec::new();
            for n in split_numbers(&c[1], line)? {
                let dir = Direction::from_id(n).ok_or_else(|| {
                    BlacklistError::LinkIndexOutOfRange {
                        line: line.to_string(),
                        index: n,
                    }
                })?;
                parsed.push(dir);
            }
            links = Some(parsed);
            rest = &rest[c[0].len()..];
        } else if let Some(m) = g.dead.find(rest) {
            if dead {
                return Err(bad_line());
            }
            dead = true;
            rest = &rest[m.end()..];
        } else {
            return Err(bad_line());
        }
    }

    if dead {
        bl.add_dead_chip(chip);
    } else {
        if let Some(cores) = cores {
            bl.add_dead_cores(chip, cores);
        }
        if let Some(links) = links {
            bl.add_dead_links(chip, links);
        }
    }
    Ok(())
}

/// Split a comma-separated list of decimal numbers.
fn split_numbers(list: &str, line: &str) -> Result<Vec<u32>, BlacklistError> {
    list.split(',')
        .map(|n| {
            n.parse::<u32>()
                .map_err(|_| BlacklistError::BadLine(line.to_string()))
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
