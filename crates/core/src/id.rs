// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Numeric handles for bindings, observers and error formats

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id source. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct IdSeq(AtomicU64);

impl IdSeq {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    pub fn next<T: From<u64>>(&self) -> T {
        T::from(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdSeq {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl From<u64> for $name {
            fn from(n: u64) -> Self {
                Self(n)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Identifies a stage binding within one pipeline
    BindingId
);
define_id!(
    /// Identifies a log or diagnostic observer
    ObserverId
);
define_id!(
    /// Identifies a registered error format
    ErrorFormatId
);
