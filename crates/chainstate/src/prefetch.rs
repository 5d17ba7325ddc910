//! Best-effort background warming of the coin cache.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use ledgerd_consensus::Hash256;

use crate::coinview::WarmCache;
use crate::error::CoinViewError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrefetchStatus {
    Pending,
    /// Finished; the count is the number of entries inserted.
    Completed(usize),
    Failed,
    /// Never ran, either because the worker was busy or has gone.
    Dropped,
}

/// Handle for one scheduled warm. Polling never blocks.
pub struct PrefetchTicket {
    reply: Option<Receiver<Result<usize, CoinViewError>>>,
    resolved: Option<PrefetchStatus>,
}

impl PrefetchTicket {
    fn dropped() -> Self {
        Self {
            reply: None,
            resolved: Some(PrefetchStatus::Dropped),
        }
    }

    pub fn poll(&mut self) -> PrefetchStatus {
        if let Some(status) = self.resolved {
            return status;
        }
        let Some(reply) = self.reply.as_ref() else {
            return PrefetchStatus::Dropped;
        };
        let status = match reply.try_recv() {
            Ok(Ok(inserted)) => PrefetchStatus::Completed(inserted),
            Ok(Err(_)) => PrefetchStatus::Failed,
            Err(TryRecvError::Empty) => return PrefetchStatus::Pending,
            Err(TryRecvError::Disconnected) => PrefetchStatus::Dropped,
        };
        self.resolved = Some(status);
        self.reply = None;
        status
    }
}

struct PrefetchJob {
    cache: Arc<dyn WarmCache>,
    txids: Vec<Hash256>,
    epoch: u64,
    reply: Sender<Result<usize, CoinViewError>>,
}

/// Single worker thread with a one-slot queue.
pub struct Prefetcher {
    jobs: Option<Sender<PrefetchJob>>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    pub fn spawn() -> io::Result<Self> {
        let (jobs, queue) = crossbeam_channel::bounded::<PrefetchJob>(1);
        let worker = thread::Builder::new()
            .name("utxo-prefetch".to_string())
            .spawn(move || {
                for job in queue.iter() {
                    let result = job.cache.warm(&job.txids, job.epoch);
                    if let Err(err) = &result {
                        ledgerd_log::log_debug!("utxo prefetch failed: {err}");
                    }
                    let _ = job.reply.send(result);
                }
            })?;
        Ok(Self {
            jobs: Some(jobs),
            worker: Some(worker),
        })
    }

    /// Queues a warm of `txids` unless the worker already has one waiting.
    pub fn schedule(&self, cache: Arc<dyn WarmCache>, txids: Vec<Hash256>) -> PrefetchTicket {
        let Some(jobs) = self.jobs.as_ref() else {
            return PrefetchTicket::dropped();
        };
        let (reply, receiver) = crossbeam_channel::bounded(1);
        let epoch = cache.epoch();
        let job = PrefetchJob {
            cache,
            txids,
            epoch,
            reply,
        };
        match jobs.try_send(job) {
            Ok(()) => PrefetchTicket {
                reply: Some(receiver),
                resolved: None,
            },
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                PrefetchTicket::dropped()
            }
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct CountingCache {
        calls: AtomicUsize,
        epoch: u64,
    }

    impl WarmCache for CountingCache {
        fn epoch(&self) -> u64 {
            self.epoch
        }

        fn warm(&self, txids: &[Hash256], epoch: u64) -> Result<usize, CoinViewError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if epoch != self.epoch {
                return Ok(0);
            }
            Ok(txids.len())
        }
    }

    fn wait(ticket: &mut PrefetchTicket) -> PrefetchStatus {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = ticket.poll();
            if status != PrefetchStatus::Pending || Instant::now() > deadline {
                return status;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn ticket_reports_completion() {
        let prefetcher = Prefetcher::spawn().expect("spawn");
        let cache = Arc::new(CountingCache {
            calls: AtomicUsize::new(0),
            epoch: 3,
        });
        let mut ticket = prefetcher.schedule(cache.clone(), vec![[1u8; 32], [2u8; 32]]);
        assert_eq!(wait(&mut ticket), PrefetchStatus::Completed(2));
        assert_eq!(ticket.poll(), PrefetchStatus::Completed(2));
        assert_eq!(cache.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_ticket_stays_dropped() {
        let mut ticket = PrefetchTicket::dropped();
        assert_eq!(ticket.poll(), PrefetchStatus::Dropped);
    }
}
