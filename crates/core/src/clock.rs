// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Clock abstraction for testable time handling

use chrono::{DateTime, Local};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A clock that provides monotonic and wall-clock time
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    fn wall_now(&self) -> DateTime<Local>;
}

/// Real system clock
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_now(&self) -> DateTime<Local> {
        Local::now()
    }
}

struct FakeTime {
    instant: Instant,
    wall: DateTime<Local>,
}

/// Fake clock for testing with controllable time
#[derive(Clone)]
pub struct FakeClock {
    current: Arc<Mutex<FakeTime>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(FakeTime {
                instant: Instant::now(),
                wall: Local::now(),
            })),
        }
    }

    /// Advance both clocks by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.instant += duration;
        if let Ok(delta) = chrono::Duration::from_std(duration) {
            current.wall += delta;
        }
    }

    /// Set the wall clock to a specific time
    pub fn set_wall(&self, wall: DateTime<Local>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.wall = wall;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).instant
    }

    fn wall_now(&self) -> DateTime<Local> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).wall
    }
}

#[cfg(test)]
#[path = "clock_tests.rs"]
mod tests;
