use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use aurum_chain::{
    ChainParams, ChainStore, Mempool, MempoolConfig, MempoolError, Miner, MinerOutcome, NoBonus,
    NodeEvent, NonceTracker, RewardBonus, TransactionValidator,
};
use aurum_config::AurumConfig;
use aurum_core::address::Network;
use aurum_core::params::now_ts;
use aurum_core::transaction::Transaction;
use aurum_rpc::ApiState;
use aurum_spv::LightClientService;
use aurum_storage::ChainDisk;
use aurum_sync::{
    BandwidthThrottle, ChunkFetcher, ChunkedSyncService, HttpChunkFetcher, SyncDownloader,
    SyncDownloaderConfig,
};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// The wired core: every component injected explicitly, no globals.
pub struct CoreServices {
    pub network: Network,
    pub store: Arc<ChainStore>,
    pub mempool: Arc<Mempool>,
    pub nonce: Arc<NonceTracker>,
    pub spv: Arc<LightClientService>,
    pub sync: Arc<ChunkedSyncService>,
    pub downloader: Arc<SyncDownloader>,
    pub bonus: Arc<dyn RewardBonus>,
}

impl CoreServices {
    pub fn build(config: &AurumConfig) -> Result<Self> {
        let network = parse_network(&config.node.network)?;
        let disk = ChainDisk::open(PathBuf::from(&config.node.data_dir))?;
        let nonce = Arc::new(NonceTracker::new());
        let bonus: Arc<dyn RewardBonus> = Arc::new(NoBonus);

        let params = ChainParams {
            network,
            genesis_difficulty: config.consensus.genesis_difficulty,
            difficulty_window: config.consensus.difficulty_window,
            checkpoint_interval: config.consensus.checkpoint_interval,
        };
        let store = Arc::new(ChainStore::open(
            params,
            disk.clone(),
            nonce.clone(),
            bonus.clone(),
        )?);

        let mempool_config = MempoolConfig {
            max_size: config.mempool.max_size,
            max_per_sender: config.mempool.max_per_sender,
            min_fee_rate: config.mempool.min_fee_rate,
            max_age_secs: config.mempool.max_age_secs,
            invalid_threshold: config.mempool.invalid_threshold,
            invalid_window_secs: config.mempool.invalid_window_secs,
            invalid_ban_secs: config.mempool.invalid_ban_secs,
            max_per_block: config.mempool.max_per_block,
        };
        let mempool = Arc::new(Mempool::new(
            mempool_config,
            TransactionValidator::new(network),
            nonce.clone(),
        ));

        let spv = Arc::new(LightClientService::new(store.clone()));
        let sync = Arc::new(ChunkedSyncService::new(disk.clone(), config.sync.chunk_size));
        let downloader = Arc::new(SyncDownloader::new(
            ChunkedSyncService::new(disk, config.sync.chunk_size),
            BandwidthThrottle::new(config.sync.bandwidth_limit_bytes),
            SyncDownloaderConfig {
                max_retries_per_chunk: config.sync.max_retries_per_chunk,
                retry_rounds: config.sync.retry_rounds,
                progress_flush_interval: 10,
            },
        ));

        Ok(Self {
            network,
            store,
            mempool,
            nonce,
            spv,
            sync,
            downloader,
            bonus,
        })
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            store: self.store.clone(),
            mempool: self.mempool.clone(),
            spv: self.spv.clone(),
            sync: self.sync.clone(),
            downloader: self.downloader.clone(),
            events: self.store.event_sender(),
        }
    }

    /// Submit a transaction: chain read lock first, then the mempool lock.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), MempoolError> {
        self.store
            .with_utxo(|utxo| self.mempool.add_transaction(tx, utxo, now_ts()))
    }

    /// Catch a fresh node up from a peer's snapshot surface. Blocking:
    /// run on a worker thread.
    pub fn sync_from_peer(&self, base_url: &str) -> Result<()> {
        let fetcher = HttpChunkFetcher::new(base_url, Duration::from_secs(30))
            .map_err(|e| anyhow!("building chunk fetcher: {e}"))?;
        let snapshot_id = fetcher
            .fetch_latest_manifest()
            .map_err(|e| anyhow!("fetching manifest: {e}"))?
            .snapshot_id;
        let payload_bytes = self
            .downloader
            .sync_snapshot(&fetcher)
            .map_err(|e| anyhow!("chunked download failed: {e}"))?;
        let payload = aurum_chain::SnapshotPayload::from_bytes(&payload_bytes)
            .context("snapshot payload did not decode")?;
        self.store.adopt_snapshot(payload)?;
        let _ = self.store.event_sender().send(NodeEvent::Sync {
            snapshot_id,
            progress_percent: 100.0,
            failed_chunks: 0,
        });
        info!(height = self.store.height(), "state sync complete");
        Ok(())
    }

    /// Publish the current snapshot for peers to download.
    pub fn publish_snapshot(&self) -> Result<aurum_sync::SnapshotManifest> {
        let payload = self.store.snapshot_payload()?;
        let bytes = payload
            .to_bytes()
            .context("snapshot payload serialization")?;
        Ok(self.sync.build_snapshot(&bytes, payload.checkpoint.height)?)
    }
}

pub async fn run_node(config_path: PathBuf) -> Result<()> {
    let config = AurumConfig::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    init_logging();
    info!(config = %config_path.display(), "starting aurum node");

    let services = Arc::new(CoreServices::build(&config)?);
    spawn_pruner(services.clone());
    spawn_stats_publisher(services.clone());
    if config.node.mine {
        spawn_miner(services.clone(), config.node.miner_address.clone())?;
    }

    let addr: SocketAddr = config.api.listen_addr.parse().context("api.listen_addr")?;
    aurum_rpc::serve(addr, services.api_state()).await?;
    Ok(())
}

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Background expiry pass over the mempool, plus orphan promotion.
fn spawn_pruner(services: Arc<CoreServices>) {
    tokio::spawn(async move {
        let mut ticker = interval(PRUNE_INTERVAL);
        loop {
            ticker.tick().await;
            let now = now_ts();
            let (expired, orphans) = services.mempool.prune_expired(now);
            if expired > 0 || orphans > 0 {
                info!(expired, orphans, "mempool pruned");
            }
            let promoted = services
                .store
                .with_utxo(|utxo| services.mempool.promote_orphans(utxo, now));
            if promoted > 0 {
                info!(promoted, "orphans promoted into the mempool");
            }
        }
    });
}

fn spawn_stats_publisher(services: Arc<CoreServices>) {
    tokio::spawn(async move {
        let events = services.store.event_sender();
        let mut ticker = interval(STATS_INTERVAL);
        loop {
            ticker.tick().await;
            let stats = services.store.stats();
            let _ = events.send(NodeEvent::Stats {
                height: stats.height,
                pending_transactions: services.mempool.len(),
                difficulty: stats.difficulty,
                total_supply: stats.total_supply,
            });
        }
    });
}

/// Dedicated mining thread. A `NewBlock` event flips the cancellation
/// flag so a candidate for an already-taken height is abandoned.
fn spawn_miner(services: Arc<CoreServices>, miner_address: String) -> Result<()> {
    if miner_address.is_empty() {
        return Err(anyhow!("mining enabled but node.miner_address is empty"));
    }
    let miner = Arc::new(Miner::new(services.network, miner_address));

    let cancel = miner.cancel_flag();
    let mut events = services.store.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if matches!(event, NodeEvent::NewBlock { .. }) {
                cancel.store(true, std::sync::atomic::Ordering::Relaxed);
            }
        }
    });

    std::thread::Builder::new()
        .name("aurum-miner".into())
        .spawn(move || loop {
            match miner.mine_pending(&services.store, &services.mempool, &*services.bonus) {
                Ok(MinerOutcome::Mined(block)) => {
                    info!(index = block.header.index, "mined block");
                }
                Ok(MinerOutcome::Cancelled) => {}
                Err(e) => {
                    warn!(error = %e, "mining attempt failed");
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        })
        .context("spawning miner thread")?;
    Ok(())
}

fn parse_network(raw: &str) -> Result<Network> {
    match raw {
        "mainnet" => Ok(Network::Mainnet),
        "testnet" => Ok(Network::Testnet),
        other => Err(anyhow!("unknown network {other:?} (expected mainnet or testnet)")),
    }
}
