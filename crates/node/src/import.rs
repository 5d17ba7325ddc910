//! Block import from a file of length-prefixed consensus-encoded blocks.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use ledgerd_chainstate::{ChainIndex, ChainIndexError};
use ledgerd_consensus::constants::MAX_BLOCK_WEIGHT;
use ledgerd_consensus::{hash256_to_hex, ConsensusParams};
use ledgerd_pow::check_proof_of_work;
use ledgerd_primitives::block::Block;
use ledgerd_storage::KeyValueStore;
use serde::Serialize;

use ledgerd_log as logging;

#[derive(Debug, Default)]
pub struct ImportStats {
    read: AtomicU64,
    sent: AtomicU64,
    bad_pow: AtomicU64,
    orphaned: AtomicU64,
    done: AtomicBool,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ImportSnapshot {
    pub read: u64,
    pub sent: u64,
    pub bad_pow: u64,
    pub orphaned: u64,
    pub done: bool,
}

impl ImportStats {
    pub fn snapshot(&self) -> ImportSnapshot {
        ImportSnapshot {
            read: self.read.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            bad_pow: self.bad_pow.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            done: self.done.load(Ordering::Relaxed),
        }
    }
}

/// Reads one record. `Ok(None)` at a clean end of input.
pub fn read_block<R: Read>(reader: &mut R) -> Result<Option<Block>, String> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(format!("import read failed: {err}")),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len == 0 {
        return Err("import record has invalid length 0".to_string());
    }
    if len > MAX_BLOCK_WEIGHT {
        return Err(format!(
            "import record length {len} exceeds MAX_BLOCK_WEIGHT"
        ));
    }
    let mut bytes = vec![0u8; len as usize];
    reader
        .read_exact(&mut bytes)
        .map_err(|err| format!("import read failed for payload (len {len}): {err}"))?;
    Block::consensus_decode(&bytes)
        .map(Some)
        .map_err(|err| format!("import record does not decode: {err}"))
}

pub fn write_block<W: Write>(writer: &mut W, block: &Block) -> std::io::Result<()> {
    let bytes = block.consensus_encode();
    writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
    writer.write_all(&bytes)
}

/// Feeds every record of `reader` to `sender`, indexing headers first.
///
/// Blocks failing proof of work or lacking an indexed parent are dropped.
/// Returns the number of blocks sent. Stops early once the receiver is gone.
pub fn import_blocks<R: Read, S: KeyValueStore>(
    reader: &mut R,
    chain: &ChainIndex<S>,
    params: &ConsensusParams,
    sender: &Sender<Block>,
    stats: &ImportStats,
) -> Result<u64, String> {
    let mut sent = 0u64;
    while let Some(block) = read_block(reader)? {
        stats.read.fetch_add(1, Ordering::Relaxed);
        let hash = block.hash();
        if let Err(err) = check_proof_of_work(&hash, block.header.bits, params) {
            stats.bad_pow.fetch_add(1, Ordering::Relaxed);
            logging::log_warn!("import: block {} dropped: {err}", hash256_to_hex(&hash));
            continue;
        }
        match chain.insert_header(&block.header) {
            Ok(_) => {}
            Err(ChainIndexError::MissingParent(parent)) => {
                stats.orphaned.fetch_add(1, Ordering::Relaxed);
                logging::log_warn!(
                    "import: block {} dropped, parent {} unknown",
                    hash256_to_hex(&hash),
                    hash256_to_hex(&parent)
                );
                continue;
            }
            Err(err) => return Err(format!("import: header index failed: {err}")),
        }
        if sender.send(block).is_err() {
            logging::log_info!("import: consensus loop stopped, import ends early");
            break;
        }
        sent += 1;
        stats.sent.fetch_add(1, Ordering::Relaxed);
    }
    Ok(sent)
}

/// Runs `import_blocks` over `path` on its own thread. The sender is
/// dropped when the file is exhausted, which disconnects the puller.
pub fn spawn_importer<S: KeyValueStore + Send + Sync + 'static>(
    path: PathBuf,
    chain: Arc<ChainIndex<S>>,
    params: ConsensusParams,
    sender: Sender<Block>,
    stats: Arc<ImportStats>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("block-import".to_string())
        .spawn(move || {
            let result = File::open(&path)
                .map_err(|err| format!("failed to open {}: {err}", path.display()))
                .and_then(|file| {
                    let mut reader = BufReader::new(file);
                    import_blocks(&mut reader, &chain, &params, &sender, &stats)
                });
            stats.done.store(true, Ordering::Relaxed);
            match result {
                Ok(sent) => logging::log_info!(
                    "import of {} finished, {sent} blocks queued",
                    path.display()
                ),
                Err(err) => logging::log_error!("{err}"),
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_chainstate::validator::script_push_int;
    use ledgerd_consensus::{chain_params, Network};
    use ledgerd_primitives::block::{merkle_root, BlockHeader};
    use ledgerd_primitives::build_genesis_block;
    use ledgerd_primitives::outpoint::OutPoint;
    use ledgerd_primitives::transaction::{Transaction, TxIn, TxOut, SEQUENCE_FINAL};
    use ledgerd_storage::memory::MemoryStore;
    use std::io::Cursor;

    fn regtest() -> (ConsensusParams, Block) {
        let chain = chain_params(Network::Regtest);
        let genesis = build_genesis_block(&chain.genesis).expect("genesis");
        (chain.consensus, genesis)
    }

    fn child(prev: &BlockHeader, height: i64, params: &ConsensusParams, want_pow: bool) -> Block {
        let mut script_sig = script_push_int(height);
        script_sig.extend_from_slice(&[0x01, 0x2a]);
        let coinbase = Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let (root, _) = merkle_root(&[coinbase.txid()]);
        let mut header = BlockHeader {
            version: 0x2000_0000,
            prev_block: prev.hash(),
            merkle_root: root,
            time: prev.time + 600,
            bits: prev.bits,
            nonce: 0,
        };
        while check_proof_of_work(&header.hash(), header.bits, params).is_ok() != want_pow {
            header.nonce += 1;
        }
        Block {
            header,
            transactions: vec![coinbase],
        }
    }

    fn indexed_chain(genesis: &Block) -> ChainIndex<MemoryStore> {
        let chain = ChainIndex::new(Arc::new(MemoryStore::new()));
        chain.insert_header(&genesis.header).expect("genesis header");
        chain
    }

    #[test]
    fn imported_headers_are_indexed_before_blocks_are_sent() {
        let (params, genesis) = regtest();
        let first = child(&genesis.header, 1, &params, true);
        let second = child(&first.header, 2, &params, true);
        let mut file = Vec::new();
        write_block(&mut file, &first).expect("write");
        write_block(&mut file, &second).expect("write");

        let chain = indexed_chain(&genesis);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stats = ImportStats::default();
        let sent = import_blocks(&mut Cursor::new(file), &chain, &params, &sender, &stats)
            .expect("import");

        assert_eq!(sent, 2);
        assert_eq!(receiver.try_recv().expect("first"), first);
        assert_eq!(receiver.try_recv().expect("second"), second);
        let best = chain.best_header().expect("best").expect("some");
        assert_eq!(best.hash, second.hash());
        assert_eq!(best.height, 2);
        assert_eq!(stats.snapshot().read, 2);
    }

    #[test]
    fn bad_pow_and_orphans_are_dropped() {
        let (params, genesis) = regtest();
        let weak = child(&genesis.header, 1, &params, false);
        let first = child(&genesis.header, 1, &params, true);
        let second = child(&first.header, 2, &params, true);
        let mut file = Vec::new();
        write_block(&mut file, &weak).expect("write");
        write_block(&mut file, &second).expect("write");

        let chain = indexed_chain(&genesis);
        let (sender, receiver) = crossbeam_channel::unbounded();
        let stats = ImportStats::default();
        let sent = import_blocks(&mut Cursor::new(file), &chain, &params, &sender, &stats)
            .expect("import");

        assert_eq!(sent, 0);
        assert!(receiver.try_recv().is_err());
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bad_pow, 1);
        assert_eq!(snapshot.orphaned, 1);
        assert!(!chain.contains(&weak.hash()).expect("contains"));
    }

    #[test]
    fn truncated_record_is_an_error() {
        let (params, genesis) = regtest();
        let first = child(&genesis.header, 1, &params, true);
        let mut file = Vec::new();
        write_block(&mut file, &first).expect("write");
        file.truncate(file.len() - 3);
        assert!(read_block(&mut Cursor::new(file)).is_err());
    }

    #[test]
    fn zero_length_record_is_an_error() {
        let file = vec![0u8; 4];
        assert!(read_block(&mut Cursor::new(file)).is_err());
        assert_eq!(read_block(&mut Cursor::new(Vec::new())).expect("eof"), None);
    }
}
