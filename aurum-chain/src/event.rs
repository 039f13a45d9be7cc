use serde::Serialize;

/// Push events fanned out to WebSocket subscribers and internal workers.
///
/// The `topic` tag doubles as the subscription key on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum NodeEvent {
    Stats {
        height: u64,
        pending_transactions: usize,
        difficulty: u32,
        total_supply: f64,
    },
    Sync {
        snapshot_id: String,
        progress_percent: f64,
        failed_chunks: usize,
    },
    NewBlock {
        index: u64,
        hash: String,
        tx_count: usize,
    },
    NewTx {
        txid: String,
        sender: String,
        fee_rate: f64,
    },
}

impl NodeEvent {
    /// Subscription key this event publishes under.
    pub fn topic(&self) -> &'static str {
        match self {
            NodeEvent::Stats { .. } => "stats",
            NodeEvent::Sync { .. } => "sync",
            NodeEvent::NewBlock { .. } => "new_block",
            NodeEvent::NewTx { .. } => "new_tx",
        }
    }
}
