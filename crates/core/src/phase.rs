// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build phases
//!
//! A [`Phase`] is a bit set. The low bits name the primary phases in build
//! order, two modifier bits order stages before or after the primary group of
//! a phase, and two status bits report how the last operation ended.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Phase: u32 {
        const PREPARE = 1 << 0;
        const DOWNLOADS = 1 << 1;
        const DEPENDENCIES = 1 << 2;
        const AUTOGEN = 1 << 3;
        const CONFIGURE = 1 << 4;
        const BUILD = 1 << 5;
        const INSTALL = 1 << 6;
        const COMMIT = 1 << 7;
        const EXPORT = 1 << 8;
        const FINAL = 1 << 9;

        const BEFORE = 1 << 28;
        const AFTER = 1 << 29;

        const FINISHED = 1 << 30;
        const FAILED = 1 << 31;
    }
}

/// Position of a stage relative to the primary group of its phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Whence {
    Before,
    Primary,
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseError {
    #[error("unknown phase: {0}")]
    Unknown(String),
    #[error("unknown phase modifier: {0}")]
    UnknownWhence(String),
    #[error("phase {0} must name exactly one primary phase")]
    NotSingle(Phase),
    #[error("phase {0} cannot be both before and after")]
    ConflictingWhence(Phase),
    #[error("phase {0} carries status bits")]
    StatusBits(Phase),
}

const NICKS: [(Phase, &str); 10] = [
    (Phase::PREPARE, "prepare"),
    (Phase::DOWNLOADS, "downloads"),
    (Phase::DEPENDENCIES, "dependencies"),
    (Phase::AUTOGEN, "autogen"),
    (Phase::CONFIGURE, "configure"),
    (Phase::BUILD, "build"),
    (Phase::INSTALL, "install"),
    (Phase::COMMIT, "commit"),
    (Phase::EXPORT, "export"),
    (Phase::FINAL, "final"),
];

impl Phase {
    pub const NONE: Phase = Phase::empty();
    /// All primary phase bits.
    pub const MASK: Phase = Phase::from_bits_retain(0x3ff);
    pub const WHENCE_MASK: Phase = Phase::from_bits_retain((1 << 28) | (1 << 29));
    pub const STATUS_MASK: Phase = Phase::from_bits_retain((1 << 30) | (1 << 31));

    /// Primary phases in build order.
    pub fn primaries() -> impl Iterator<Item = Phase> {
        NICKS.iter().map(|(phase, _)| *phase)
    }

    /// The primary phase bits of this value.
    pub fn primary(self) -> Phase {
        self & Phase::MASK
    }

    pub fn whence(self) -> Whence {
        if self.contains(Phase::BEFORE) {
            Whence::Before
        } else if self.contains(Phase::AFTER) {
            Whence::After
        } else {
            Whence::Primary
        }
    }

    /// Lowest primary phase set, if any.
    pub fn lowest(self) -> Option<Phase> {
        let bits = self.primary().bits();
        (bits != 0).then(|| Phase::from_bits_retain(bits & bits.wrapping_neg()))
    }

    /// Highest primary phase set, if any.
    pub fn highest(self) -> Option<Phase> {
        let bits = self.primary().bits();
        (bits != 0).then(|| Phase::from_bits_retain(1 << (31 - bits.leading_zeros())))
    }

    /// Bit position of the lowest primary phase. Empty phases sort last.
    pub fn ordinal(self) -> u32 {
        self.lowest().map_or(u32::MAX, |p| p.bits().trailing_zeros())
    }

    /// The highest primary phase together with every phase before it.
    pub fn and_earlier(self) -> Phase {
        match self.highest() {
            Some(p) => Phase::from_bits_retain(p.bits() | (p.bits() - 1)) & Phase::MASK,
            None => Phase::NONE,
        }
    }

    /// The lowest primary phase together with every phase after it.
    pub fn and_later(self) -> Phase {
        match self.lowest() {
            Some(p) => Phase::MASK & !Phase::from_bits_retain(p.bits() - 1),
            None => Phase::NONE,
        }
    }

    /// Checks that this value can be used to bind a stage.
    pub fn validate_binding(self) -> Result<(), PhaseError> {
        if self.intersects(Phase::STATUS_MASK) {
            return Err(PhaseError::StatusBits(self));
        }
        if self.contains(Phase::WHENCE_MASK) {
            return Err(PhaseError::ConflictingWhence(self));
        }
        if self.primary().bits().count_ones() != 1 {
            return Err(PhaseError::NotSingle(self));
        }
        Ok(())
    }

    /// Nick of the lowest primary phase.
    pub fn nick(self) -> Option<&'static str> {
        let lowest = self.lowest()?;
        NICKS
            .iter()
            .find(|(phase, _)| *phase == lowest)
            .map(|(_, nick)| *nick)
    }

    pub fn with_whence(self, whence: Whence) -> Phase {
        let base = self - Phase::WHENCE_MASK;
        match whence {
            Whence::Before => base | Phase::BEFORE,
            Whence::Primary => base,
            Whence::After => base | Phase::AFTER,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.contains(Phase::FAILED) {
            return f.write_str("failed");
        }
        if self.contains(Phase::FINISHED) {
            return f.write_str("finished");
        }
        let Some(nick) = self.nick() else {
            return f.write_str("none");
        };
        f.write_str(nick)?;
        match self.whence() {
            Whence::Before => f.write_str(":before"),
            Whence::Primary => Ok(()),
            Whence::After => f.write_str(":after"),
        }
    }
}

impl FromStr for Phase {
    type Err = PhaseError;

    /// Parses `build`, `build:before`, `build:after`, `finished`, `failed` or `none`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, whence) = match s.split_once(':') {
            Some((name, whence)) => (name, Some(whence)),
            None => (s, None),
        };
        let name = name.trim().to_ascii_lowercase();

        let base = match name.as_str() {
            "none" => Phase::NONE,
            "finished" => Phase::FINISHED,
            "failed" => Phase::FAILED,
            other => NICKS
                .iter()
                .find(|(_, nick)| *nick == other)
                .map(|(phase, _)| *phase)
                .ok_or_else(|| PhaseError::Unknown(s.to_string()))?,
        };

        match whence.map(|w| w.trim().to_ascii_lowercase()) {
            None => Ok(base),
            Some(w) if base.primary().is_empty() => Err(PhaseError::UnknownWhence(w)),
            Some(w) => match w.as_str() {
                "before" => Ok(base | Phase::BEFORE),
                "after" => Ok(base | Phase::AFTER),
                _ => Err(PhaseError::UnknownWhence(w)),
            },
        }
    }
}

impl Serialize for Phase {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "phase_tests.rs"]
mod tests;
