//! The `ledgerd` node: configuration, storage, and the consensus loop driver.

use ledgerd_log as logging;

pub mod import;
pub mod status;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use ledgerd_chainstate::{
    BlockPuller, BlockResult, CachedCoinView, ChainIndex, ChainedHeader, ChannelPuller, CoinView,
    ConsensusLoop, ConsensusValidator, DbCoinView, LoopError, LoopOptions, PullError, UtxoDelta,
    Validator, DEFAULT_COIN_CACHE_ENTRIES,
};
use ledgerd_consensus::{chain_params, hash256_to_hex, ChainParams, Network};
use ledgerd_primitives::build_genesis_block;
use ledgerd_storage::fjall::{FjallOptions, FjallStore, FjallTelemetrySnapshot};
use ledgerd_storage::memory::MemoryStore;
use ledgerd_storage::{Column, KeyValueStore, ScanResult, StoreError, WriteBatch};
use tokio::sync::{oneshot, watch};

use crate::import::{spawn_importer, ImportStats};
use crate::status::{
    bind_status, serve_status, snapshot_status, LoopStatus, StatusContext, StatusSnapshot,
};

const DATA_DIR_NAME: &str = ".ledgerd";
const CONF_FILE_NAME: &str = "ledgerd.conf";
const DB_DIR_NAME: &str = "db";
const DATA_DIR_LOCK_FILE_NAME: &str = ".lock";
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 15;
const IMPORT_QUEUE: usize = 64;

const DEFAULT_CONF_TEMPLATE: &str = "\
# ledgerd configuration. Command-line flags take precedence over this file.
#
# Network selection (default mainnet).
#testnet=1
#regtest=1
#
# Status server. Without rpcallowip only loopback addresses are bound.
#server=1
#rpcport=8332
#rpcbind=127.0.0.1
#rpcallowip=10.0.0.1
#
# Consensus loop.
#prefetch=1
#coincache=200000
#
# Storage (fjall backend), in MiB.
#dbcache=256
#
# Logging.
#loglevel=info
#logformat=text
";

const SUPPORTED_CONF_KEYS: &[&str] = &[
    "testnet",
    "regtest",
    "server",
    "rpcport",
    "rpcbind",
    "rpcallowip",
    "prefetch",
    "coincache",
    "dbcache",
    "loglevel",
    "logformat",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn fjall_telemetry_snapshot(&self) -> Option<FjallTelemetrySnapshot> {
        match self {
            Store::Fjall(store) => Some(store.telemetry_snapshot()),
            Store::Memory(_) => None,
        }
    }

    /// Makes every committed batch durable. A no-op in memory.
    pub fn persist(&self) -> Result<(), StoreError> {
        match self {
            Store::Fjall(store) => store.persist(),
            Store::Memory(_) => Ok(()),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        match self {
            Store::Memory(store) => store.scan_prefix(column, prefix),
            Store::Fjall(store) => store.scan_prefix(column, prefix),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}

pub type NodeCoinView = CachedCoinView<DbCoinView<Store>>;

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub import: Option<PathBuf>,
    pub prefetch: bool,
    pub coin_cache_entries: usize,
    /// Block cache for the fjall backend; fjall's default when unset.
    pub db_cache_mb: Option<u64>,
    pub log_level: logging::Level,
    pub log_format: logging::Format,
    pub log_timestamps: bool,
    pub status_interval_secs: u64,
    pub server: bool,
    pub rpc: RpcEndpoints,
    pub unsupported_conf_keys: Vec<String>,
}

/// Where the status server listens and who may talk to it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpcEndpoints {
    pub binds: Vec<SocketAddr>,
    pub allow_ips: Vec<IpAddr>,
    /// `rpcbind` was given without any `rpcallowip` and fell back to loopback.
    pub ignored_binds: bool,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

struct DataDirLock {
    _file: File,
}

fn lock_data_dir(data_dir: &Path) -> Result<DataDirLock, String> {
    let lock_path = data_dir.join(DATA_DIR_LOCK_FILE_NAME);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|err| format!("failed to open lock file {}: {err}", lock_path.display()))?;

    match file.try_lock_exclusive() {
        Ok(()) => {
            let pid = std::process::id();
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={pid}");
            let _ = file.flush();
            Ok(DataDirLock { _file: file })
        }
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            let mut holder = String::new();
            let _ =
                File::open(&lock_path).and_then(|mut reader| reader.read_to_string(&mut holder));
            Err(format!(
                "data dir {} is already locked by another ledgerd ({})",
                data_dir.display(),
                holder.trim()
            ))
        }
        Err(err) => Err(format!(
            "failed to lock data dir {} (lock file {}): {err}",
            data_dir.display(),
            lock_path.display()
        )),
    }
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args_from(std::env::args().skip(1))? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("ledgerd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run_with_config(Instant::now(), config).await,
    }
}

async fn run_with_config(start_time: Instant, config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    if !config.unsupported_conf_keys.is_empty() {
        logging::log_warn!(
            "Ignoring unsupported keys in {}: {}",
            config.conf_path.display(),
            config.unsupported_conf_keys.join(", ")
        );
    }
    if config.server && config.rpc.ignored_binds {
        logging::log_warn!("rpcbind ignored without rpcallowip; binding loopback only");
    }

    let _lock = lock_data_dir(&config.data_dir)?;
    let params = chain_params(config.network);
    logging::log_info!(
        "ledgerd {} starting on {} ({} backend, data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.backend.as_str(),
        config.data_dir.display()
    );

    let store = Arc::new(open_store(
        config.backend,
        &config.data_dir.join(DB_DIR_NAME),
        config.db_cache_mb,
    )?);
    let chain = Arc::new(ChainIndex::new(Arc::clone(&store)));
    let db_view = DbCoinView::new(Arc::clone(&store));
    bootstrap_genesis(&chain, &db_view, &params)?;
    let coin_view: Arc<NodeCoinView> =
        Arc::new(CachedCoinView::new(db_view, config.coin_cache_entries));

    let (sender, puller) = ChannelPuller::bounded(IMPORT_QUEUE);
    let import_stats = Arc::new(ImportStats::default());
    match config.import.clone() {
        Some(path) => {
            spawn_importer(
                path,
                Arc::clone(&chain),
                params.consensus.clone(),
                sender,
                Arc::clone(&import_stats),
            )
            .map_err(|err| format!("failed to start importer: {err}"))?;
        }
        None => {
            logging::log_info!("No --import given; the loop stops once the block source closes");
            drop(sender);
        }
    }

    let consensus = ConsensusLoop::new(
        ConsensusValidator::new(params.consensus.clone()),
        Arc::clone(&chain),
        Arc::clone(&coin_view),
        puller,
        LoopOptions {
            prefetch: config.prefetch,
        },
    )
    .map_err(|err| err.to_string())?;

    let (status_tx, status_rx) = watch::channel(loop_status(&consensus, &LoopStatus::default()));
    let context = Arc::new(StatusContext {
        network: config.network,
        backend: config.backend,
        start_time,
        store: Arc::clone(&store),
        chain: Arc::clone(&chain),
        coin_view: Arc::clone(&coin_view),
        metrics: Arc::clone(consensus.metrics()),
        import: Arc::clone(&import_stats),
        loop_status: status_rx,
    });

    let (done_tx, mut done_rx) = oneshot::channel();
    thread::Builder::new()
        .name("consensus-loop".to_string())
        .spawn(move || {
            let result = drive_loop(consensus, &status_tx);
            let _ = done_tx.send(result);
        })
        .map_err(|err| format!("failed to start consensus loop thread: {err}"))?;

    spawn_status_logger(Arc::clone(&context), config.status_interval_secs);

    if config.server {
        let listeners = bind_status(&config.rpc.binds).await?;
        let allow = config.rpc.allow_ips.clone();
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            if let Err(err) = serve_status(listeners, allow, context).await {
                logging::log_error!("status server stopped: {err}");
            }
        });
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            logging::log_info!("Signal received; shutting down.");
            Ok(())
        }
        finished = &mut done_rx => {
            let result = finished
                .unwrap_or_else(|_| Err("consensus loop thread exited unexpectedly".to_string()));
            if let Err(err) = &result {
                logging::log_error!("{err}");
            }
            if config.server {
                logging::log_info!("Consensus loop idle; status server keeps running until Ctrl-C.");
                shutdown_signal().await;
                logging::log_info!("Signal received; shutting down.");
            }
            result
        }
    };
    if let Err(err) = store.persist() {
        logging::log_error!("failed to persist store on shutdown: {err}");
    }
    outcome
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                logging::log_warn!("failed to install SIGTERM handler: {err}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Indexes the genesis header and, on a fresh store, commits the coin set
/// to it. The genesis coinbase is never spendable, so the delta is empty.
pub fn bootstrap_genesis<S: KeyValueStore>(
    chain: &ChainIndex<S>,
    view: &DbCoinView<S>,
    params: &ChainParams,
) -> Result<ChainedHeader, String> {
    let genesis = build_genesis_block(&params.genesis)
        .map_err(|err| format!("invalid genesis parameters: {err}"))?;
    let hash = genesis.hash();
    if hash != params.consensus.hash_genesis_block {
        return Err(format!(
            "genesis hash mismatch: built {} expected {}",
            hash256_to_hex(&hash),
            hash256_to_hex(&params.consensus.hash_genesis_block)
        ));
    }
    let entry = chain
        .insert_header(&genesis.header)
        .map_err(|err| format!("failed to index genesis: {err}"))?;
    let best = view.best_block_hash().map_err(|err| err.to_string())?;
    if best == [0u8; 32] {
        view.save_changes(&UtxoDelta::new(), &[0u8; 32], &hash)
            .map_err(|err| format!("failed to initialize coin set: {err}"))?;
        logging::log_info!("Initialized coin set at genesis {}", hash256_to_hex(&hash));
    }
    Ok(entry)
}

fn loop_status<X, V, P, S>(
    consensus: &ConsensusLoop<X, V, P, S>,
    previous: &LoopStatus,
) -> LoopStatus
where
    X: Validator,
    V: CoinView,
    P: BlockPuller,
    S: KeyValueStore,
{
    LoopStatus {
        tip_height: consensus.tip().height,
        tip_hash: hash256_to_hex(&consensus.tip().hash),
        activation: consensus.activation_cache().stats(),
        resyncs: previous.resyncs,
        last_invalid: previous.last_invalid.clone(),
        stopped: previous.stopped,
    }
}

/// Advances until the block source closes, publishing status after every
/// block. A rejected commit is answered with a resync from the store.
pub fn drive_loop<X, V, P, S>(
    mut consensus: ConsensusLoop<X, V, P, S>,
    publisher: &watch::Sender<LoopStatus>,
) -> Result<(), String>
where
    X: Validator,
    V: CoinView,
    P: BlockPuller,
    S: KeyValueStore,
{
    let mut status = loop_status(&consensus, &LoopStatus::default());
    let result = loop {
        match consensus.advance() {
            BlockResult::Connected(_) => {}
            BlockResult::Invalid { hash, error } => {
                status.last_invalid = Some(format!("{} {error}", hash256_to_hex(&hash)));
            }
            BlockResult::Failed(LoopError::Pull(PullError::Disconnected)) => {
                logging::log_info!(
                    "Block source closed at height {} ({})",
                    consensus.tip().height,
                    hash256_to_hex(&consensus.tip().hash)
                );
                break Ok(());
            }
            BlockResult::Failed(LoopError::CommitRejected { .. })
            | BlockResult::Failed(LoopError::Diverged) => match consensus.resync() {
                Ok(tip) => {
                    status.resyncs += 1;
                    logging::log_warn!(
                        "Resynced consensus loop to store tip {} at height {}",
                        hash256_to_hex(&tip.hash),
                        tip.height
                    );
                }
                Err(err) => break Err(format!("consensus loop resync failed: {err}")),
            },
            BlockResult::Failed(err) => break Err(format!("consensus loop stopped: {err}")),
        }
        status = loop_status(&consensus, &status);
        publisher.send_replace(status.clone());
    };
    status = loop_status(&consensus, &status);
    status.stopped = true;
    publisher.send_replace(status);
    result
}

fn spawn_status_logger(context: Arc<StatusContext>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }

    let interval = Duration::from_secs(interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut last: Option<StatusSnapshot> = None;
        loop {
            ticker.tick().await;
            match snapshot_status(&context) {
                Ok(snapshot) => {
                    let blocks_per_sec = last.as_ref().map_or(0.0, |last| {
                        snapshot.consensus.connected.saturating_sub(last.consensus.connected)
                            as f64
                            / interval.as_secs_f64()
                    });
                    let consensus = &snapshot.consensus;
                    logging::log_info!(
                        "Status: tip {} {} headers {} connected {} invalid {} b/s {:.2} fetch_us {} val_us {} utxo_us {} exec_us {} commit_us {} cache_hits {} cache_misses {} uptime {}s",
                        snapshot.consensus_loop.tip_height,
                        short_hash(&snapshot.consensus_loop.tip_hash),
                        snapshot.best_header_height.unwrap_or(-1),
                        consensus.connected,
                        consensus.invalid,
                        blocks_per_sec,
                        consensus.block_fetch.average_us(),
                        consensus.validation.average_us(),
                        consensus.utxo_fetch.average_us(),
                        consensus.execution.average_us(),
                        consensus.commit.average_us(),
                        snapshot.coin_cache.hits,
                        snapshot.coin_cache.misses,
                        snapshot.uptime_secs,
                    );
                    last = Some(snapshot);
                }
                Err(err) => logging::log_warn!("status snapshot failed: {err}"),
            }
        }
    });
}

fn short_hash(hex: &str) -> &str {
    hex.get(..16).unwrap_or(hex)
}

fn open_store(backend: Backend, db_path: &Path, db_cache_mb: Option<u64>) -> Result<Store, String> {
    match backend {
        Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
        Backend::Fjall => {
            let options = FjallOptions {
                cache_bytes: db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
                ..FjallOptions::default()
            };
            let store = FjallStore::open_with_options(db_path, options)
                .map_err(|err| format!("failed to open {}: {err}", db_path.display()))?;
            Ok(Store::Fjall(store))
        }
    }
}

fn default_data_dir(network: Network) -> PathBuf {
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(DATA_DIR_NAME).join(network.as_str())
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut conf_path: Option<PathBuf> = None;
    let mut network = Network::Mainnet;
    let mut network_set = false;
    let mut import: Option<PathBuf> = None;
    let mut prefetch = true;
    let mut prefetch_set = false;
    let mut coin_cache_entries = DEFAULT_COIN_CACHE_ENTRIES;
    let mut coin_cache_set = false;
    let mut db_cache_mb: Option<u64> = None;
    let mut log_level = logging::Level::Info;
    let mut log_level_set = false;
    let mut log_format = logging::Format::Text;
    let mut log_format_set = false;
    let mut log_timestamps = true;
    let mut status_interval_secs = DEFAULT_STATUS_INTERVAL_SECS;

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--conf" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --conf\n{}", usage()))?;
                conf_path = Some(PathBuf::from(value));
            }
            "--network" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --network\n{}", usage()))?;
                network = Network::parse(&value)
                    .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?;
                network_set = true;
            }
            "--testnet" => {
                network = Network::Testnet;
                network_set = true;
            }
            "--regtest" => {
                network = Network::Regtest;
                network_set = true;
            }
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--import" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --import\n{}", usage()))?;
                import = Some(PathBuf::from(value));
            }
            "--prefetch" => {
                prefetch = true;
                prefetch_set = true;
            }
            "--no-prefetch" => {
                prefetch = false;
                prefetch_set = true;
            }
            "--coin-cache-entries" => {
                let value = args.next().ok_or_else(|| {
                    format!("missing value for --coin-cache-entries\n{}", usage())
                })?;
                coin_cache_entries = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid coin cache entries '{value}'\n{}", usage()))?;
                coin_cache_set = true;
            }
            "--db-cache-mb" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --db-cache-mb\n{}", usage()))?;
                db_cache_mb = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid db cache size '{value}'\n{}", usage()))?,
                );
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
                log_level_set = true;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
                log_format_set = true;
            }
            "--log-timestamps" => log_timestamps = true,
            "--no-log-timestamps" => log_timestamps = false,
            "--status-interval" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --status-interval\n{}", usage()))?;
                status_interval_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid status interval '{value}'\n{}", usage()))?;
            }
            other => return Err(format!("unknown argument '{other}'\n{}", usage())),
        }
    }

    let data_dir_explicit = data_dir.is_some();
    let mut data_dir = data_dir.unwrap_or_else(|| default_data_dir(network));
    fs::create_dir_all(&data_dir)
        .map_err(|err| format!("failed to create data dir {}: {err}", data_dir.display()))?;
    let conf_file = conf_path.unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = match load_conf(&conf_file)? {
        Some(conf) => conf,
        None => {
            write_default_conf(&conf_file)?;
            HashMap::new()
        }
    };

    if !network_set {
        let testnet = conf_flag(&conf, "testnet", &conf_file)?.unwrap_or(false);
        let regtest = conf_flag(&conf, "regtest", &conf_file)?.unwrap_or(false);
        network = match (testnet, regtest) {
            (true, true) => {
                return Err(format!(
                    "testnet and regtest are both set in {}",
                    conf_file.display()
                ))
            }
            (true, false) => Network::Testnet,
            (false, true) => Network::Regtest,
            (false, false) => Network::Mainnet,
        };
        if !data_dir_explicit && network != Network::Mainnet {
            data_dir = default_data_dir(network);
            fs::create_dir_all(&data_dir).map_err(|err| {
                format!("failed to create data dir {}: {err}", data_dir.display())
            })?;
        }
    }

    if !prefetch_set {
        if let Some(value) = conf_flag(&conf, "prefetch", &conf_file)? {
            prefetch = value;
        }
    }
    if !coin_cache_set {
        if let Some(raw) = conf_last(&conf, "coincache") {
            coin_cache_entries = raw.parse::<usize>().map_err(|_| {
                format!("invalid coincache '{raw}' in {}", conf_file.display())
            })?;
        }
    }
    if db_cache_mb.is_none() {
        if let Some(raw) = conf_last(&conf, "dbcache") {
            db_cache_mb = Some(raw.parse::<u64>().map_err(|_| {
                format!("invalid dbcache '{raw}' in {}", conf_file.display())
            })?);
        }
    }
    if !log_level_set {
        if let Some(raw) = conf_last(&conf, "loglevel") {
            log_level = logging::Level::parse(raw).ok_or_else(|| {
                format!("invalid loglevel '{raw}' in {}", conf_file.display())
            })?;
        }
    }
    if !log_format_set {
        if let Some(raw) = conf_last(&conf, "logformat") {
            log_format = logging::Format::parse(raw).ok_or_else(|| {
                format!("invalid logformat '{raw}' in {}", conf_file.display())
            })?;
        }
    }

    let server = conf_flag(&conf, "server", &conf_file)?.unwrap_or(false);
    let rpc_port = match conf_last(&conf, "rpcport") {
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| format!("invalid rpcport '{raw}' in {}", conf_file.display()))?,
        None => chain_params(network).default_rpc_port,
    };
    let empty = Vec::new();
    let rpc = resolve_rpc_endpoints(
        conf.get("rpcbind").unwrap_or(&empty),
        conf.get("rpcallowip").unwrap_or(&empty),
        rpc_port,
    )
    .map_err(|err| format!("{err} in {}", conf_file.display()))?;

    let mut unsupported_conf_keys: Vec<String> = conf
        .keys()
        .filter(|key| !SUPPORTED_CONF_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();
    unsupported_conf_keys.sort();

    Ok(CliAction::Run(Config {
        backend,
        data_dir,
        conf_path: conf_file,
        network,
        import,
        prefetch,
        coin_cache_entries,
        db_cache_mb,
        log_level,
        log_format,
        log_timestamps,
        status_interval_secs,
        server,
        rpc,
        unsupported_conf_keys,
    }))
}

/// Applies the bind policy: no allow-list means loopback only, an
/// allow-list without binds means every interface.
pub fn resolve_rpc_endpoints(
    binds: &[String],
    allow_ips: &[String],
    port: u16,
) -> Result<RpcEndpoints, String> {
    let allow_ips = allow_ips
        .iter()
        .map(|raw| {
            raw.trim()
                .parse::<IpAddr>()
                .map_err(|_| format!("invalid rpcallowip '{raw}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let parsed_binds = binds
        .iter()
        .map(|raw| {
            parse_socket_addr_with_default_port(raw, port)
                .ok_or_else(|| format!("invalid rpcbind '{raw}'"))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if allow_ips.is_empty() {
        return Ok(RpcEndpoints {
            binds: vec![
                SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port),
                SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
            ],
            allow_ips,
            ignored_binds: !parsed_binds.is_empty(),
        });
    }
    let binds = if parsed_binds.is_empty() {
        vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port),
        ]
    } else {
        parsed_binds
    };
    Ok(RpcEndpoints {
        binds,
        allow_ips,
        ignored_binds: false,
    })
}

fn parse_socket_addr_with_default_port(value: &str, default_port: u16) -> Option<SocketAddr> {
    let value = value.trim();
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }
    let inner = value.strip_prefix('[')?.strip_suffix(']')?;
    inner
        .parse::<Ipv6Addr>()
        .ok()
        .map(|ip| SocketAddr::new(IpAddr::V6(ip), default_port))
}

fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(idx) = line.find('#') {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

fn write_default_conf(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("failed to create {}: {err}", parent.display()))?;
    }
    fs::write(path, DEFAULT_CONF_TEMPLATE)
        .map_err(|err| format!("failed to write {}: {err}", path.display()))
}

fn conf_last<'a>(conf: &'a HashMap<String, Vec<String>>, key: &str) -> Option<&'a str> {
    conf.get(key)
        .and_then(|values| values.last())
        .map(String::as_str)
}

fn conf_flag(
    conf: &HashMap<String, Vec<String>>,
    key: &str,
    conf_file: &Path,
) -> Result<Option<bool>, String> {
    match conf_last(conf, key) {
        Some(raw) => parse_conf_bool(raw)
            .map(Some)
            .ok_or_else(|| format!("invalid {key} value '{raw}' in {}", conf_file.display())),
        None => Ok(None),
    }
}

fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn usage() -> String {
    [
        "Usage: ledgerd [OPTIONS]",
        "",
        "Options:",
        "  --data-dir <dir>            Data directory (default: $HOME/.ledgerd/<network>)",
        "  --conf <file>               Config file path (default: <data-dir>/ledgerd.conf)",
        "  --network <name>            mainnet, testnet or regtest (default: mainnet)",
        "  --testnet                   Shorthand for --network testnet",
        "  --regtest                   Shorthand for --network regtest",
        "  --backend <name>            memory or fjall (default: fjall)",
        "  --import <file>             Feed length-prefixed blocks from a file",
        "  --prefetch / --no-prefetch  Warm the coin cache ahead of the loop (default: on)",
        "  --coin-cache-entries <n>    Coin cache capacity (default: 200000)",
        "  --db-cache-mb <n>           fjall block cache size in MiB",
        "  --log-level <level>         error, warn, info, debug or trace (default: info)",
        "  --log-format <format>       text or json (default: text)",
        "  --log-timestamps            Prefix log lines with timestamps (default)",
        "  --no-log-timestamps         Omit timestamps from log lines",
        "  --status-interval <secs>    Status log interval, 0 disables (default: 15)",
        "  --help                      Show this help",
        "  --version                   Show the version",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_config(args: &[&str]) -> Result<Config, String> {
        match parse_args_from(args.iter().map(|arg| arg.to_string()))? {
            CliAction::Run(config) => Ok(config),
            other => panic!("unexpected action {other:?}"),
        }
    }

    fn config_with_conf(conf: &str, extra: &[&str]) -> Result<Config, String> {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join(CONF_FILE_NAME), conf).expect("write conf");
        let data_dir = dir.path().to_string_lossy().to_string();
        let mut args = vec!["--data-dir", data_dir.as_str()];
        args.extend_from_slice(extra);
        let config = run_config(&args);
        drop(dir);
        config
    }

    #[test]
    fn missing_conf_is_created_from_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let data_dir = dir.path().join("nested");
        let data_arg = data_dir.to_string_lossy().to_string();
        let config = run_config(&["--data-dir", &data_arg, "--regtest"]).expect("config");

        let conf_path = data_dir.join(CONF_FILE_NAME);
        assert_eq!(config.conf_path, conf_path);
        let written = fs::read_to_string(&conf_path).expect("template");
        assert_eq!(written, DEFAULT_CONF_TEMPLATE);
        assert_eq!(config.network, Network::Regtest);
        assert!(!config.server);
        assert!(config.unsupported_conf_keys.is_empty());
    }

    #[test]
    fn without_allow_ips_binds_fall_back_to_loopback() {
        let config =
            config_with_conf("server=1\nrpcbind=0.0.0.0:9000\n", &["--regtest"]).expect("config");
        assert!(config.server);
        assert!(config.rpc.ignored_binds);
        assert_eq!(
            config.rpc.binds,
            vec![
                "[::1]:18443".parse::<SocketAddr>().expect("addr"),
                "127.0.0.1:18443".parse::<SocketAddr>().expect("addr"),
            ]
        );
    }

    #[test]
    fn allow_ips_without_binds_use_wildcards() {
        let config = config_with_conf("server=1\nrpcport=9100\nrpcallowip=10.0.0.1\n", &[])
            .expect("config");
        assert!(!config.rpc.ignored_binds);
        assert_eq!(
            config.rpc.binds,
            vec![
                "[::]:9100".parse::<SocketAddr>().expect("addr"),
                "0.0.0.0:9100".parse::<SocketAddr>().expect("addr"),
            ]
        );
        assert_eq!(
            config.rpc.allow_ips,
            vec!["10.0.0.1".parse::<IpAddr>().expect("ip")]
        );
    }

    #[test]
    fn explicit_binds_accept_bare_hosts_and_brackets() {
        let endpoints = resolve_rpc_endpoints(
            &["10.0.0.2".to_string(), "[::1]".to_string(), "127.0.0.1:7000".to_string()],
            &["10.0.0.3".to_string(), "10.0.0.4".to_string()],
            8332,
        )
        .expect("endpoints");
        assert_eq!(
            endpoints.binds,
            vec![
                "10.0.0.2:8332".parse::<SocketAddr>().expect("addr"),
                "[::1]:8332".parse::<SocketAddr>().expect("addr"),
                "127.0.0.1:7000".parse::<SocketAddr>().expect("addr"),
            ]
        );
        assert_eq!(endpoints.allow_ips.len(), 2);
    }

    #[test]
    fn invalid_rpc_values_are_errors() {
        let err = config_with_conf("rpcallowip=not-an-ip\n", &[]).expect_err("bad allow ip");
        assert!(err.contains("invalid rpcallowip 'not-an-ip'"));
        let err = config_with_conf("rpcallowip=10.0.0.1\nrpcbind=nowhere:x\n", &[])
            .expect_err("bad bind");
        assert!(err.contains("invalid rpcbind"));
    }

    #[test]
    fn command_line_overrides_conf_file() {
        let conf = "loglevel=debug\nprefetch=off\ncoincache=10\nlogformat=json\n";
        let config = config_with_conf(conf, &["--log-level", "warn", "--prefetch"])
            .expect("config");
        assert_eq!(config.log_level, logging::Level::Warn);
        assert!(config.prefetch);
        assert_eq!(config.coin_cache_entries, 10);
        assert_eq!(config.log_format, logging::Format::Json);
    }

    #[test]
    fn conf_network_and_unknown_keys() {
        let config = config_with_conf("testnet=yes\nmaxpeers=3\n# comment\n; other\n", &[])
            .expect("config");
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.unsupported_conf_keys, vec!["maxpeers".to_string()]);
        let err = config_with_conf("testnet=1\nregtest=1\n", &[]).expect_err("conflict");
        assert!(err.contains("both set"));
    }

    #[test]
    fn conf_booleans() {
        for raw in ["1", "true", "YES", "on", ""] {
            assert_eq!(parse_conf_bool(raw), Some(true), "{raw}");
        }
        for raw in ["0", "false", "No", "OFF"] {
            assert_eq!(parse_conf_bool(raw), Some(false), "{raw}");
        }
        assert_eq!(parse_conf_bool("maybe"), None);
    }

    #[test]
    fn help_version_and_unknown_flags() {
        assert!(matches!(
            parse_args_from(["--help".to_string()]),
            Ok(CliAction::PrintHelp)
        ));
        assert!(matches!(
            parse_args_from(["--version".to_string()]),
            Ok(CliAction::PrintVersion)
        ));
        assert!(parse_args_from(["--bogus".to_string()]).is_err());
        assert!(parse_args_from(["--backend".to_string(), "rocks".to_string()]).is_err());
    }

    #[test]
    fn genesis_bootstrap_is_idempotent() {
        let params = chain_params(Network::Regtest);
        let store = Arc::new(MemoryStore::new());
        let chain = ChainIndex::new(Arc::clone(&store));
        let view = DbCoinView::new(Arc::clone(&store));

        let first = bootstrap_genesis(&chain, &view, &params).expect("bootstrap");
        assert_eq!(first.height, 0);
        assert_eq!(first.hash, params.consensus.hash_genesis_block);
        assert_eq!(
            view.best_block_hash().expect("best"),
            params.consensus.hash_genesis_block
        );
        let second = bootstrap_genesis(&chain, &view, &params).expect("bootstrap again");
        assert_eq!(second, first);
        assert_eq!(store.len(Column::Coins).expect("len"), 0);
    }

    #[test]
    fn db_cache_comes_from_flag_or_conf() {
        let config = config_with_conf("dbcache=64\n", &[]).expect("config");
        assert_eq!(config.db_cache_mb, Some(64));
        assert!(config.unsupported_conf_keys.is_empty());
        let config =
            config_with_conf("dbcache=64\n", &["--db-cache-mb", "8"]).expect("config");
        assert_eq!(config.db_cache_mb, Some(8));
        assert!(config_with_conf("dbcache=lots\n", &[]).is_err());
    }

    #[test]
    fn fjall_store_counts_bootstrap_commits() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(
            open_store(Backend::Fjall, &dir.path().join(DB_DIR_NAME), Some(8)).expect("open"),
        );
        let params = chain_params(Network::Regtest);
        let chain = ChainIndex::new(Arc::clone(&store));
        let view = DbCoinView::new(Arc::clone(&store));
        bootstrap_genesis(&chain, &view, &params).expect("bootstrap");
        store.persist().expect("persist");

        let telemetry = store.fjall_telemetry_snapshot().expect("fjall telemetry");
        assert_eq!(telemetry.batches_committed, 2);
        assert_eq!(telemetry.coin_batches, 0);
        assert!(Store::Memory(MemoryStore::new()).fjall_telemetry_snapshot().is_none());
    }

    #[test]
    fn second_lock_on_data_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _held = lock_data_dir(dir.path()).expect("first lock");
        let err = lock_data_dir(dir.path()).err().expect("second lock fails");
        assert!(err.contains("already locked"));
    }
}
