// SPDX-License-Identifier: EUPL-1.2-or-later
// Copyright © 2026-present ipcmd Contributors

//! OS-process monitor
//!
//! Watches a stream of OS process-exit notifications, filters for the pids
//! the daemon cares about (applications holding registrations or flows, and
//! the user workers of live IPCPs) and turns each hit into a
//! `ProcessFinalized` event on the unified stream. The monitor runs as its
//! own task; the stop token bounds shutdown latency.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::events::{Event, EventSender};

/// Set of pids of interest, shared between the orchestrator (which adds and
/// removes pids as registrations, flows and workers come and go) and the
/// monitor (which filters against it).
#[derive(Debug, Clone, Default)]
pub struct PidTracker {
    inner: Arc<RwLock<HashSet<u32>>>,
}

impl PidTracker {
    pub fn watch(&self, pid: u32) {
        self.inner.write().expect("pid tracker lock poisoned").insert(pid);
    }

    pub fn unwatch(&self, pid: u32) {
        self.inner.write().expect("pid tracker lock poisoned").remove(&pid);
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.inner.read().expect("pid tracker lock poisoned").contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("pid tracker lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The monitor task. `exits` carries every process exit the OS reports; the
/// platform-specific subscription (netlink process connector on Linux) lives
/// with the daemon bootstrap, outside this module.
#[derive(Debug)]
pub struct ProcessMonitor {
    exits: mpsc::UnboundedReceiver<u32>,
    tracker: PidTracker,
    events: EventSender,
}

impl ProcessMonitor {
    pub fn new(
        exits: mpsc::UnboundedReceiver<u32>,
        tracker: PidTracker,
        events: EventSender,
    ) -> Self {
        Self {
            exits,
            tracker,
            events,
        }
    }

    /// Runs until the stop token fires or the exit source closes.
    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("OS process monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                exit = self.exits.recv() => {
                    let Some(pid) = exit else { break };
                    if self.tracker.contains(pid) {
                        debug!(pid, "watched process exited");
                        let _ = self.events.send(Event::ProcessFinalized { pid });
                    } else {
                        trace!(pid, "ignoring exit of unwatched process");
                    }
                }
            }
        }
        debug!("OS process monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;

    #[tokio::test]
    async fn test_monitor_filters_pids_of_interest() {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (event_tx, mut event_rx) = event_channel();
        let tracker = PidTracker::default();
        tracker.watch(4242);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(ProcessMonitor::new(exit_rx, tracker.clone(), event_tx).run(cancel.clone()));

        exit_tx.send(1).unwrap();
        exit_tx.send(4242).unwrap();
        exit_tx.send(7).unwrap();

        let ev = event_rx.recv().await.unwrap();
        assert!(matches!(ev, Event::ProcessFinalized { pid: 4242 }));

        cancel.cancel();
        task.await.unwrap();
        // Only the watched pid produced an event.
        assert!(event_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_tracker_watch_unwatch() {
        let tracker = PidTracker::default();
        assert!(tracker.is_empty());
        tracker.watch(9);
        assert!(tracker.contains(9));
        tracker.unwatch(9);
        assert!(!tracker.contains(9));
    }
}
