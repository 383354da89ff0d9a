//! Tokio host for the monitor core.
//!
//! The core itself is a synchronous state machine; this shell owns it on a
//! single task, feeding it inbound messages, election outcomes, timer
//! firings, and admin queries in arrival order. That task is the "one
//! logical mutex" of the design.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::monitor::Envelope;
use crate::monitor::Monitor;

/// Read-only operator queries answered by the running monitor.
#[derive(Debug, Clone, Copy)]
pub enum AdminQuery {
    /// Lifecycle snapshot.
    MonStatus,
    /// Quorum snapshot.
    QuorumStatus,
    /// Sync-role snapshot.
    SyncStatus,
}

enum Op {
    Deliver(Envelope),
    ConnectionReset(SocketAddr),
    ElectionWon {
        epoch: u64,
        quorum: BTreeSet<u32>,
    },
    ElectionLost {
        epoch: u64,
        quorum: BTreeSet<u32>,
        leader: u32,
    },
    Admin(AdminQuery, oneshot::Sender<Value>),
}

/// Handle to a monitor running on its own task.
pub struct MonitorHandle {
    tx: mpsc::Sender<Op>,
    cancel: CancellationToken,
    join: JoinHandle<Monitor>,
}

impl MonitorHandle {
    /// Feed one inbound message.
    pub async fn deliver(&self, env: Envelope) -> Result<()> {
        self.tx
            .send(Op::Deliver(env))
            .await
            .context("monitor task is gone")
    }

    /// Report a lost connection.
    pub async fn connection_reset(&self, addr: SocketAddr) -> Result<()> {
        self.tx
            .send(Op::ConnectionReset(addr))
            .await
            .context("monitor task is gone")
    }

    /// Deliver a won-election outcome from the election module.
    pub async fn election_won(&self, epoch: u64, quorum: BTreeSet<u32>) -> Result<()> {
        self.tx
            .send(Op::ElectionWon { epoch, quorum })
            .await
            .context("monitor task is gone")
    }

    /// Deliver a lost-election outcome from the election module.
    pub async fn election_lost(
        &self,
        epoch: u64,
        quorum: BTreeSet<u32>,
        leader: u32,
    ) -> Result<()> {
        self.tx
            .send(Op::ElectionLost {
                epoch,
                quorum,
                leader,
            })
            .await
            .context("monitor task is gone")
    }

    /// Run an operator query.
    pub async fn admin(&self, query: AdminQuery) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Op::Admin(query, tx))
            .await
            .context("monitor task is gone")?;
        rx.await.context("monitor task dropped the query")
    }

    /// Stop the monitor and return the final core for inspection.
    pub async fn shutdown(self) -> Result<Monitor> {
        self.cancel.cancel();
        self.join.await.context("monitor task panicked")
    }

    /// Whether the monitor task has already exited (e.g. self-fenced).
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Spawn a monitor onto its own task and initialize it.
pub fn spawn(mut monitor: Monitor) -> MonitorHandle {
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Op>(1024);
    let task_cancel = cancel.clone();

    let join = tokio::spawn(async move {
        monitor.init(Instant::now());

        loop {
            if monitor.is_fenced() {
                tracing::error!(name = %monitor.name(), "monitor fenced itself; stopping");
                break;
            }
            let deadline = monitor.next_deadline();
            tokio::select! {
                _ = task_cancel.cancelled() => {
                    monitor.shutdown();
                    break;
                }
                op = rx.recv() => {
                    let now = Instant::now();
                    match op {
                        None => {
                            monitor.shutdown();
                            break;
                        }
                        Some(Op::Deliver(env)) => monitor.dispatch(env, now),
                        Some(Op::ConnectionReset(addr)) => monitor.handle_connection_reset(addr),
                        Some(Op::ElectionWon { epoch, quorum }) => {
                            monitor.win_election(epoch, quorum, now);
                        }
                        Some(Op::ElectionLost { epoch, quorum, leader }) => {
                            monitor.lose_election(epoch, quorum, leader, now);
                        }
                        Some(Op::Admin(query, reply)) => {
                            let doc = match query {
                                AdminQuery::MonStatus => crate::admin::mon_status(&monitor),
                                AdminQuery::QuorumStatus => crate::admin::quorum_status(&monitor),
                                AdminQuery::SyncStatus => crate::admin::sync_status(&monitor),
                            };
                            let _ = reply.send(doc);
                        }
                    }
                }
                _ = sleep_until_opt(deadline) => {
                    monitor.fire_due(Instant::now());
                }
            }
        }
        monitor
    });

    MonitorHandle { tx, cancel, join }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
