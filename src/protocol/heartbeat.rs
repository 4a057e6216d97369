use super::Shared;
use crate::error::Error;
use crate::storage::LogStorage;
use crate::types::Peer;
use async_channel::Receiver;
use log::{error, trace};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Keeps one follower fed while this replica leads. Sends an append whenever
/// new entries show up and an empty one every heartbeat interval otherwise.
pub(crate) struct Replicator<S: LogStorage> {
    peer: Peer,
    shared: Arc<Shared<S>>,
    notify_rx: Receiver<()>,
}

impl<S: LogStorage> Replicator<S> {
    pub(crate) fn new(peer: Peer, shared: Arc<Shared<S>>, notify_rx: Receiver<()>) -> Replicator<S> {
        Replicator {
            peer,
            shared,
            notify_rx,
        }
    }

    pub(crate) async fn run(self, token: CancellationToken) {
        trace!("Starting replication to {}", self.peer);
        // Announce the new leader without waiting for the first interval.
        let mut pending = true;
        loop {
            if !pending {
                tokio::select! {
                    _ = token.cancelled() => break,
                    notified = self.notify_rx.recv() => if notified.is_err() {
                        break;
                    },
                    _ = tokio::time::sleep(self.shared.settings.heartbeat_interval) => {}
                }
            }
            // Whatever was queued gets picked up by this request.
            while self.notify_rx.try_recv().is_ok() {}
            pending = match self.replicate_once(&token).await {
                Some(more) => more,
                None => break,
            };
        }
        trace!("Stopped replication to {}", self.peer);
    }

    /// Sends one append. Returns `None` once this replica no longer leads,
    /// otherwise whether the follower needs another request right away.
    pub(crate) async fn replicate_once(&self, token: &CancellationToken) -> Option<bool> {
        let outbound = {
            let mut st = self.shared.state.lock().await;
            if token.is_cancelled() {
                return None;
            }
            match st.build_append_request(&self.peer.id) {
                Ok(Some(outbound)) => outbound,
                Ok(None) => return None,
                Err(e) => {
                    error!("Failed to build append request for {}: {}", self.peer, e);
                    return Some(false);
                }
            }
        };
        trace!(
            "{:?} to {}: prev {}/{} with {} entries",
            outbound.kind,
            self.peer,
            outbound.request.prev_log_index,
            outbound.request.prev_log_term,
            outbound.request.entries.len()
        );

        let response = tokio::select! {
            _ = token.cancelled() => return None,
            response = tokio::time::timeout(
                self.shared.settings.append_timeout,
                self.shared.transport.append_entries(&self.peer.id, outbound.request.clone()),
            ) => response,
        };

        let mut st = self.shared.state.lock().await;
        if token.is_cancelled() {
            return None;
        }
        let result = match response {
            Ok(Ok(response)) => st.on_append_response(&self.peer.id, &outbound, response),
            Ok(Err(e)) => {
                st.on_append_failure(&self.peer.id, &outbound, &e);
                Ok(false)
            }
            Err(_) => {
                let e = Error::ReplicationTimeout(self.peer.id.clone());
                st.on_append_failure(&self.peer.id, &outbound, &e);
                Ok(false)
            }
        };
        match result {
            Ok(more) => Some(more),
            Err(e) => {
                error!("Failed to process append response from {}: {}", self.peer, e);
                if st.escalate(e).is_fatal() {
                    None
                } else {
                    Some(false)
                }
            }
        }
    }
}
