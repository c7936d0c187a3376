//! Accounting hub
//!
//! One ingest task drains the publish channel shared by every capture
//! session and merges snapshots into per-interface histories; a retention
//! task prunes windows past their age limit; reporters query aggregates
//! over a trailing duration.

use crate::core::flow::{FlowCollection, FlowCollectionHistory, FlowTimestamp};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const DEFAULT_PUBLISH_CHANNEL_SIZE: usize = 16;
pub const DEFAULT_RETENTION_SECS: i64 = 300;
pub const RETENTION_TICK_SECS: u64 = 5;

/// Central store merging published snapshots and answering aggregation
/// queries.
///
/// Built once by the supervisor; the interface set is fixed before the
/// hub is shared, so queries and ingest only synchronize on the
/// per-interface history mutexes.
pub struct Accounting {
    histories: HashMap<String, FlowCollectionHistory>,
    retention_secs: i64,
    publish_tx: mpsc::Sender<FlowCollection>,
}

impl Accounting {
    pub fn new(retention_secs: i64) -> (Self, mpsc::Receiver<FlowCollection>) {
        let (publish_tx, publish_rx) = mpsc::channel(DEFAULT_PUBLISH_CHANNEL_SIZE);
        (
            Self {
                histories: HashMap::new(),
                retention_secs,
                publish_tx,
            },
            publish_rx,
        )
    }

    pub fn add_interface(&mut self, interface_name: &str) {
        self.histories
            .entry(interface_name.to_string())
            .or_insert_with(|| FlowCollectionHistory::new(interface_name));
    }

    /// Producer handle for a capture session's rotate task. Sends block
    /// when the channel is full; that backpressure is preferred over
    /// dropping a window.
    pub fn sender(&self) -> mpsc::Sender<FlowCollection> {
        self.publish_tx.clone()
    }

    pub fn histories(&self) -> impl Iterator<Item = &FlowCollectionHistory> {
        self.histories.values()
    }

    pub fn history(&self, interface_name: &str) -> Option<&FlowCollectionHistory> {
        self.histories.get(interface_name)
    }

    /// Sum the trailing `duration` seconds for one interface. `None` when
    /// the interface was never registered.
    pub fn aggregate_by_duration(
        &self,
        interface_name: &str,
        duration: i64,
    ) -> Option<(FlowCollection, FlowTimestamp)> {
        self.histories
            .get(interface_name)
            .map(|hist| hist.aggregate_by_duration(duration))
    }

    pub fn ingest(&self, collection: FlowCollection) {
        match self.histories.get(&collection.interface_name) {
            Some(hist) => hist.ingest(collection),
            None => error!("invalid interface name: {}", collection.interface_name),
        }
    }

    /// Drain the publish channel until cancellation.
    pub async fn run_ingest(
        &self,
        mut publish_rx: mpsc::Receiver<FlowCollection>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("accounting ingest exit");
                    return;
                }
                received = publish_rx.recv() => {
                    match received {
                        Some(collection) => self.ingest(collection),
                        None => {
                            info!("publish channel closed, accounting ingest exit");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub fn prune(&self, now: i64) {
        if self.retention_secs <= 0 {
            return;
        }
        let before = now - self.retention_secs;
        for hist in self.histories.values() {
            hist.prune_before(before);
        }
    }

    /// Periodically drop windows older than the retention limit.
    pub async fn run_retention(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(RETENTION_TICK_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("accounting retention exit");
                    return;
                }
                _ = ticker.tick() => {
                    self.prune(chrono::Utc::now().timestamp());
                }
            }
        }
    }
}
