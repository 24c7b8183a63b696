// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Cooperative cancellation
//!
//! A [`CancellationToken`] is a cheap, clonable flag. Cancelling a token
//! cancels every token adopted by it, so one operation can be governed by
//! several independent sources (the caller and the build manager).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl Inner {
    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.notify.notify_waiters();

        let children = std::mem::take(&mut *self.children.lock().unwrap_or_else(|e| e.into_inner()));
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }
}

#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Creates a token that is cancelled whenever this one is.
    pub fn child_token(&self) -> CancellationToken {
        let child = CancellationToken::new();
        self.adopt(&child);
        child
    }

    /// Makes `other` follow this token. If this token is already cancelled,
    /// `other` is cancelled immediately.
    pub fn adopt(&self, other: &CancellationToken) {
        {
            let mut children = self.inner.children.lock().unwrap_or_else(|e| e.into_inner());
            if !self.is_cancelled() {
                children.retain(|c| c.strong_count() > 0);
                children.push(Arc::downgrade(&other.inner));
                return;
            }
        }
        other.cancel();
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
#[path = "cancel_tests.rs"]
mod tests;
