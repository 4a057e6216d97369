use super::Shared;
use crate::error::{Error, Result};
use crate::storage::LogStorage;
use crate::types::{LogCommand, LogIndex};
use async_channel::Receiver;
use async_trait::async_trait;
use bytes::Bytes;
use log::{error, trace};
use std::sync::Arc;

const MAX_APPLY_BATCH: LogIndex = 100;

/// Receives committed commands, in log order, exactly once per index for the
/// lifetime of the replica.
#[async_trait]
pub trait StateMachine: Send + 'static {
    async fn apply(&mut self, index: LogIndex, command: Bytes);
}

/// Ignores every committed command.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStateMachine;

#[async_trait]
impl StateMachine for NullStateMachine {
    async fn apply(&mut self, _index: LogIndex, _command: Bytes) {}
}

/// Feeds committed entries to the state machine as the commit index moves.
pub(crate) struct LogCommitter<S: LogStorage, M: StateMachine> {
    shared: Arc<Shared<S>>,
    state_machine: M,
    commits: Receiver<()>,
    last_applied: LogIndex,
}

impl<S: LogStorage, M: StateMachine> LogCommitter<S, M> {
    pub(crate) fn new(shared: Arc<Shared<S>>, state_machine: M, commits: Receiver<()>) -> LogCommitter<S, M> {
        LogCommitter {
            shared,
            state_machine,
            commits,
            last_applied: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shared.shutdown.cancelled() => return,
                commit = self.commits.recv() => if commit.is_err() {
                    trace!("Commit channel disconnected; shutting down");
                    return;
                },
            }
            if let Err(e) = self.apply_committed().await {
                error!("Stopped applying committed entries: {}", e);
                return;
            }
        }
    }

    async fn apply_committed(&mut self) -> Result<()> {
        loop {
            let batch = {
                let st = self.shared.state.lock().await;
                let commit_index = st.commit.commit_index();
                if commit_index <= self.last_applied {
                    return Ok(());
                }
                let last = commit_index.min(self.last_applied + MAX_APPLY_BATCH);
                st.storage.read_range(self.last_applied + 1, last)?
            };
            for entry in batch {
                if entry.index != self.last_applied + 1 {
                    error!(
                        "Out of order commit transmission, expected {} and got {}",
                        self.last_applied + 1,
                        entry.index
                    );
                    return Err(Error::RaftProtocolTerminated);
                }
                if let LogCommand::Command(command) = entry.command {
                    self.state_machine.apply(entry.index, command).await;
                }
                self.last_applied = entry.index;
            }
            self.shared.state.lock().await.applied_index = self.last_applied;
            trace!("Applied log through index {}", self.last_applied);
        }
    }
}
