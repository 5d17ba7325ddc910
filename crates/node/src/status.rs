//! Loop status snapshots and the `GET /status` listener.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use ledgerd_chainstate::versionbits::ActivationCacheStats;
use ledgerd_chainstate::{
    ChainIndex, CoinCacheStats, ConsensusPerformanceCounter, ConsensusPerformanceSnapshot,
};
use ledgerd_consensus::{hash256_to_hex, Network};
use ledgerd_storage::fjall::FjallTelemetrySnapshot;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::import::{ImportSnapshot, ImportStats};
use crate::{Backend, NodeCoinView, Store};

use ledgerd_log as logging;

const MAX_REQUEST_BYTES: usize = 8192;

/// Published by the loop thread after every advance.
#[derive(Clone, Debug, Default, Serialize)]
pub struct LoopStatus {
    pub tip_height: i32,
    pub tip_hash: String,
    pub activation: ActivationCacheStats,
    pub resyncs: u64,
    pub last_invalid: Option<String>,
    pub stopped: bool,
}

#[derive(Clone, Debug, Serialize)]
pub struct FjallView {
    pub write_buffer_bytes: u64,
    pub journal_count: u64,
    pub journal_disk_space_bytes: u64,
    pub flushes_completed: u64,
    pub active_compactions: u64,
    pub header_index_segments: u64,
    pub coins_segments: u64,
    pub meta_segments: u64,
    pub batches_committed: u64,
    pub ops_committed: u64,
    pub coin_batches: u64,
    pub slow_commits: u64,
}

impl From<FjallTelemetrySnapshot> for FjallView {
    fn from(telemetry: FjallTelemetrySnapshot) -> Self {
        let [header_index_segments, coins_segments, meta_segments] = telemetry.segments;
        Self {
            write_buffer_bytes: telemetry.write_buffer_bytes,
            journal_count: telemetry.journal_count,
            journal_disk_space_bytes: telemetry.journal_disk_space_bytes,
            flushes_completed: telemetry.flushes_completed,
            active_compactions: telemetry.active_compactions,
            header_index_segments,
            coins_segments,
            meta_segments,
            batches_committed: telemetry.batches_committed,
            ops_committed: telemetry.ops_committed,
            coin_batches: telemetry.coin_batches,
            slow_commits: telemetry.slow_commits,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub network: &'static str,
    pub backend: &'static str,
    pub uptime_secs: u64,
    pub unix_time: u64,
    pub best_header_height: Option<i32>,
    pub best_header_hash: Option<String>,
    pub consensus_loop: LoopStatus,
    pub consensus: ConsensusPerformanceSnapshot,
    pub coin_cache: CoinCacheStats,
    pub import: ImportSnapshot,
    pub fjall: Option<FjallView>,
}

/// Everything a status snapshot reads from.
pub struct StatusContext {
    pub network: Network,
    pub backend: Backend,
    pub start_time: Instant,
    pub store: Arc<Store>,
    pub chain: Arc<ChainIndex<Store>>,
    pub coin_view: Arc<NodeCoinView>,
    pub metrics: Arc<ConsensusPerformanceCounter>,
    pub import: Arc<ImportStats>,
    pub loop_status: watch::Receiver<LoopStatus>,
}

pub fn snapshot_status(context: &StatusContext) -> Result<StatusSnapshot, String> {
    let best = context
        .chain
        .best_header()
        .map_err(|err| format!("header index: {err}"))?;
    let fjall = context.store.fjall_telemetry_snapshot().map(FjallView::from);
    Ok(StatusSnapshot {
        network: context.network.as_str(),
        backend: context.backend.as_str(),
        uptime_secs: context.start_time.elapsed().as_secs(),
        unix_time: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0),
        best_header_height: best.as_ref().map(|best| best.height),
        best_header_hash: best.as_ref().map(|best| hash256_to_hex(&best.hash)),
        consensus_loop: context.loop_status.borrow().clone(),
        consensus: context.metrics.snapshot(),
        coin_cache: context.coin_view.stats(),
        import: context.import.snapshot(),
        fjall,
    })
}

/// Loopback peers are always let in.
pub fn peer_allowed(peer: IpAddr, allow: &[IpAddr]) -> bool {
    let peer = match peer {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    };
    peer.is_loopback() || allow.contains(&peer)
}

/// Binds every address. Fails only when none of them bind.
pub async fn bind_status(addrs: &[SocketAddr]) -> Result<Vec<TcpListener>, String> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                logging::log_info!("Status server listening on http://{addr}");
                listeners.push(listener);
            }
            Err(err) => logging::log_warn!("status bind {addr} failed: {err}"),
        }
    }
    if listeners.is_empty() {
        return Err("status server could not bind any address".to_string());
    }
    Ok(listeners)
}

pub async fn serve_status(
    listeners: Vec<TcpListener>,
    allow: Vec<IpAddr>,
    context: Arc<StatusContext>,
) -> Result<(), String> {
    let allow = Arc::new(allow);
    let mut tasks = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let allow = Arc::clone(&allow);
        let context = Arc::clone(&context);
        tasks.push(tokio::spawn(accept_loop(listener, allow, context)));
    }
    for task in tasks {
        task.await
            .map_err(|err| format!("status listener task failed: {err}"))??;
    }
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    allow: Arc<Vec<IpAddr>>,
    context: Arc<StatusContext>,
) -> Result<(), String> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .map_err(|err| format!("status accept failed: {err}"))?;
        let allowed = peer_allowed(peer.ip(), &allow);
        let context = Arc::clone(&context);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, allowed, &context).await {
                logging::log_warn!("status connection from {peer}: {err}");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    allowed: bool,
    context: &StatusContext,
) -> Result<(), String> {
    let mut buffer = vec![0u8; MAX_REQUEST_BYTES];
    let bytes_read = stream
        .read(&mut buffer)
        .await
        .map_err(|err| err.to_string())?;
    if bytes_read == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or("/");
    let path = path.split('?').next().unwrap_or(path);

    let (status, content_type, body) = if !allowed {
        (
            "403 Forbidden",
            "text/plain; charset=utf-8",
            "forbidden".to_string(),
        )
    } else {
        match (method, path) {
            ("GET", "/status") => match snapshot_status(context)
                .and_then(|snapshot| serde_json::to_string(&snapshot).map_err(|err| err.to_string()))
            {
                Ok(json) => ("200 OK", "application/json", json),
                Err(err) => (
                    "500 Internal Server Error",
                    "text/plain; charset=utf-8",
                    format!("status error: {err}"),
                ),
            },
            ("GET", "/healthz") => ("200 OK", "text/plain; charset=utf-8", "ok".to_string()),
            _ => (
                "404 Not Found",
                "text/plain; charset=utf-8",
                "not found".to_string(),
            ),
        }
    };

    let response = build_response(status, content_type, &body);
    stream
        .write_all(&response)
        .await
        .map_err(|err| err.to_string())?;
    stream.shutdown().await.map_err(|err| err.to_string())?;
    Ok(())
}

fn build_response(status: &str, content_type: &str, body: &str) -> Vec<u8> {
    let mut response = String::new();
    response.push_str("HTTP/1.1 ");
    response.push_str(status);
    response.push_str("\r\nContent-Type: ");
    response.push_str(content_type);
    response.push_str("\r\nCache-Control: no-store\r\nConnection: close\r\nContent-Length: ");
    response.push_str(&body.len().to_string());
    response.push_str("\r\n\r\n");
    let mut bytes = response.into_bytes();
    bytes.extend_from_slice(body.as_bytes());
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_chainstate::{CachedCoinView, DbCoinView};
    use ledgerd_storage::memory::MemoryStore;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn context() -> (Arc<StatusContext>, watch::Sender<LoopStatus>) {
        let store = Arc::new(Store::Memory(MemoryStore::new()));
        let chain = Arc::new(ChainIndex::new(Arc::clone(&store)));
        let coin_view = Arc::new(CachedCoinView::new(DbCoinView::new(Arc::clone(&store)), 16));
        let (sender, receiver) = watch::channel(LoopStatus::default());
        let context = StatusContext {
            network: Network::Regtest,
            backend: Backend::Memory,
            start_time: Instant::now(),
            store,
            chain,
            coin_view,
            metrics: Arc::new(ConsensusPerformanceCounter::new()),
            import: Arc::new(ImportStats::default()),
            loop_status: receiver,
        };
        (Arc::new(context), sender)
    }

    async fn request(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: x\r\n\r\n").as_bytes())
            .await
            .expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    #[test]
    fn loopback_and_listed_peers_are_allowed() {
        let listed: IpAddr = "10.0.0.7".parse().expect("ip");
        let allow = [listed];
        assert!(peer_allowed(IpAddr::V4(Ipv4Addr::LOCALHOST), &[]));
        assert!(peer_allowed(IpAddr::V6(Ipv6Addr::LOCALHOST), &[]));
        assert!(peer_allowed(listed, &allow));
        assert!(peer_allowed(
            IpAddr::V6(Ipv4Addr::new(10, 0, 0, 7).to_ipv6_mapped()),
            &allow
        ));
        assert!(!peer_allowed("10.0.0.8".parse().expect("ip"), &allow));
    }

    #[test]
    fn response_carries_length_and_no_store() {
        let response = String::from_utf8(build_response("200 OK", "text/plain", "hello"))
            .expect("utf8");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Length: 5\r\n"));
        assert!(response.contains("Cache-Control: no-store"));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn fjall_view_splits_segments_by_column() {
        let view = FjallView::from(FjallTelemetrySnapshot {
            segments: [1, 2, 3],
            batches_committed: 5,
            coin_batches: 4,
            ..FjallTelemetrySnapshot::default()
        });
        assert_eq!(
            (view.header_index_segments, view.coins_segments, view.meta_segments),
            (1, 2, 3)
        );
        let json = serde_json::to_value(&view).expect("json");
        assert_eq!(json["batches_committed"], 5);
        assert_eq!(json["coin_batches"], 4);
    }

    #[tokio::test]
    async fn status_route_serves_published_loop_status() {
        let (context, publisher) = context();
        publisher
            .send(LoopStatus {
                tip_height: 7,
                tip_hash: "ab".repeat(32),
                ..LoopStatus::default()
            })
            .expect("publish");
        let listeners = bind_status(&["127.0.0.1:0".parse().expect("addr")])
            .await
            .expect("bind");
        let addr = listeners[0].local_addr().expect("local addr");
        tokio::spawn(serve_status(listeners, Vec::new(), context));

        let response = request(addr, "/status").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        let body = response.split("\r\n\r\n").nth(1).expect("body");
        let json: serde_json::Value = serde_json::from_str(body).expect("json");
        assert_eq!(json["network"], "regtest");
        assert_eq!(json["backend"], "memory");
        assert_eq!(json["consensus_loop"]["tip_height"], 7);
        assert!(json["fjall"].is_null());

        let missing = request(addr, "/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
    }
}
