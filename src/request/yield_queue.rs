// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Requests that asked to be resumed at the next loop turn.
//!
//! Two sets: an *active* one taking registrations and an *inactive* one
//! being drained. The swap happens atomically at the start of a drain, so a
//! request that yields again while being resumed lands in the next cycle
//! instead of spinning the current one. Arming uses a [`Notify`] the way the
//! original reactor used an eventfd: the first insert into an empty queue
//! arms it, a drain that empties it disarms.

use std::{
    collections::HashSet,
    sync::Mutex,
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Sets {
    /// Registration order is preserved for the drain.
    active: Vec<(u64, u64)>,
    members: HashSet<u64>,
    /// Ids removed while a drain is in flight; skipped when encountered.
    removed: HashSet<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct YieldQueue {
    sets: Mutex<Sets>,
    notify: Notify,
}

impl YieldQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register `id` for the next cycle. Idempotent: a second insert before
    /// the drain keeps the first token.
    pub(crate) fn enqueue(&self, id: u64, token: u64) {
        let mut sets = self.sets.lock().expect("yield queue lock poisoned");
        sets.removed.remove(&id);
        if sets.members.insert(id) {
            let was_empty = sets.active.is_empty();
            sets.active.push((id, token));
            if was_empty {
                self.notify.notify_one();
            }
        }
    }

    /// Honour removal even if a drain already swapped the entry out.
    pub(crate) fn remove(&self, id: u64) {
        let mut sets = self.sets.lock().expect("yield queue lock poisoned");
        if sets.members.remove(&id) {
            sets.active.retain(|(i, _)| *i != id);
        }
        sets.removed.insert(id);
    }

    /// Resolves once at least one registration is pending.
    pub(crate) async fn armed(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.sets.lock().expect("yield queue lock poisoned").active.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Swap the active set out and return the batch to resume, in
    /// registration order, minus anything removed meanwhile.
    pub(crate) fn drain(&self) -> Vec<(u64, u64)> {
        let (batch, removed) = {
            let mut sets = self.sets.lock().expect("yield queue lock poisoned");
            sets.members.clear();
            let removed = std::mem::take(&mut sets.removed);
            (std::mem::take(&mut sets.active), removed)
        };
        batch
            .into_iter()
            .filter(|(id, _)| !removed.contains(id))
            .collect()
    }
}
