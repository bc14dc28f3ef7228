// SPDX-License-Identifier: GPL-3.0-only

//! Render surfaces
//!
//! The controller presents every composite it produces to a
//! [`RenderSurface`]. Surfaces must not block: the controller calls
//! `present` from its session task.

use crate::pipeline::compositor::Composite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};

/// Consumer of display-ready composites
pub trait RenderSurface: Send + Sync {
    fn present(&self, composite: Composite);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullSurface;

impl RenderSurface for NullSurface {
    fn present(&self, _composite: Composite) {}
}

#[derive(Default)]
struct Slot {
    composite: Option<Arc<Composite>>,
    unread: bool,
}

/// Latest-wins composite slot
///
/// Holds the newest composite for a consumer that renders at its own pace
/// (terminal viewer, snapshot writer). Composites replaced before the
/// consumer took them are counted as overwritten. Any number of extra
/// readers (HTTP streams) can follow it through [`subscribe`](Self::subscribe).
pub struct LatestComposite {
    slot: Mutex<Slot>,
    notify: Notify,
    published: watch::Sender<Option<Arc<Composite>>>,
    presented: AtomicU64,
    overwritten: AtomicU64,
}

impl Default for LatestComposite {
    fn default() -> Self {
        Self {
            slot: Mutex::default(),
            notify: Notify::new(),
            published: watch::channel(None).0,
            presented: AtomicU64::new(0),
            overwritten: AtomicU64::new(0),
        }
    }
}

impl LatestComposite {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow every composite presented from now on
    ///
    /// Readers never affect `take_new` or the overwrite count.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Composite>>> {
        self.published.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Newest composite, read or not
    pub fn latest(&self) -> Option<Arc<Composite>> {
        self.lock().composite.clone()
    }

    /// Newest composite if it has not been taken yet
    pub fn take_new(&self) -> Option<Arc<Composite>> {
        let mut slot = self.lock();
        if !slot.unread {
            return None;
        }
        slot.unread = false;
        slot.composite.clone()
    }

    /// Wait until a composite that has not been taken is available
    pub async fn wait_new(&self) -> Arc<Composite> {
        loop {
            if let Some(composite) = self.take_new() {
                return composite;
            }
            self.notify.notified().await;
        }
    }

    pub fn presented(&self) -> u64 {
        self.presented.load(Ordering::Relaxed)
    }

    /// Composites replaced before anyone took them
    pub fn overwritten(&self) -> u64 {
        self.overwritten.load(Ordering::Relaxed)
    }
}

impl RenderSurface for LatestComposite {
    fn present(&self, composite: Composite) {
        {
            let mut slot = self.lock();
            if slot.unread {
                self.overwritten.fetch_add(1, Ordering::Relaxed);
            }
            let composite = Arc::new(composite);
            slot.composite = Some(Arc::clone(&composite));
            slot.unread = true;
            self.published.send_replace(Some(composite));
        }
        self.presented.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
    }
}
