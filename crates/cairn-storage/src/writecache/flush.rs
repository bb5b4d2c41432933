//! Moving cached objects into main storage

use super::{Shared, WriteCache};
use crate::blobstor::SubStorage;
use cairn_common::{Address, Error, Object, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Destination of flushed objects
///
/// Implemented by the shard: a flushed object is written to the blob store
/// and its storage descriptor recorded in the metabase.
pub trait FlushTarget: Send + Sync {
    /// Whether flushed objects are accepted right now
    fn can_flush(&self) -> bool {
        true
    }

    /// Persist `object` in main storage
    ///
    /// `NotFound` means the target does not know the object right now; the
    /// entry stays cached without counting as a failure.
    fn flush(&self, object: &Object) -> Result<()>;

    /// The cache turned read-only after repeated write failures
    fn on_persistent_failure(&self) {}
}

/// Result of a flush pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushRes {
    pub flushed: u64,
    pub failed: u64,
    /// Undecodable entries removed from the cache
    pub dropped: u64,
    /// Entries the target refused with `NotFound`, left cached
    pub deferred: u64,
    /// This pass crossed the failure threshold
    pub persistent_failure: bool,
}

impl WriteCache {
    /// Flush every cached object synchronously
    ///
    /// With `ignore_errors` failed entries stay cached and the pass goes on;
    /// otherwise the first failure is returned.
    pub fn flush(&self, target: &dyn FlushTarget, ignore_errors: bool) -> Result<FlushRes> {
        let (res, err) = self.shared.drain(target, ignore_errors);
        match err {
            Some(e) if !ignore_errors => Err(e),
            _ => Ok(res),
        }
    }

    /// Start the background flush loop, replacing a running one
    pub fn start_flusher(&self, target: Arc<dyn FlushTarget>) {
        self.stop_flusher();
        let shared = Arc::clone(&self.shared);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || run_flusher(&shared, target.as_ref(), &stop_rx));
        *self.stop.lock() = Some(stop_tx);
        *self.flusher.lock() = Some(handle);
    }

    /// Signal the flush loop and wait for it to exit
    pub fn stop_flusher(&self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.flusher.lock().take()
            && handle.join().is_err()
        {
            error!("write-cache flusher panicked");
        }
    }
}

fn run_flusher(shared: &Shared, target: &dyn FlushTarget, stop: &Receiver<()>) {
    let interval = Duration::from_millis(shared.config.flush_interval_ms.max(1));
    let max_backoff = Duration::from_millis(shared.config.max_backoff_ms).max(interval);
    let mut delay = interval;
    debug!("write-cache flusher started");
    loop {
        match stop.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        if shared.pending.lock().sizes.is_empty() || !target.can_flush() {
            delay = interval;
            continue;
        }

        let (res, err) = shared.drain(target, false);
        // flush_lock is released here, the target may switch modes
        if res.persistent_failure {
            target.on_persistent_failure();
        }
        delay = match err {
            None => interval,
            Some(e) => {
                let next = (delay * 2).min(max_backoff);
                warn!(error = %e, retry_in_ms = next.as_millis(), "write-cache flush failed");
                next
            }
        };
    }
    debug!("write-cache flusher stopped");
}

impl Shared {
    /// One pass over the pending set
    ///
    /// Returns the pass result and the first error seen; the pass stops at
    /// that error unless `ignore_errors` is set.
    pub(super) fn drain(
        &self,
        target: &dyn FlushTarget,
        ignore_errors: bool,
    ) -> (FlushRes, Option<Error>) {
        let _guard = self.flush_lock.lock();
        let mut res = FlushRes::default();
        let mut first_err = None;

        let mut addrs: Vec<Address> = self.pending.lock().sizes.keys().copied().collect();
        addrs.sort();

        for addr in addrs {
            let data = match self.tree.get(&addr, &[]) {
                Ok(data) => data,
                Err(e) if e.is_not_found() => {
                    // deleted meanwhile
                    self.pending.lock().remove(&addr);
                    continue;
                }
                Err(e) => {
                    res.failed += 1;
                    warn!(%addr, error = %e, "failed to read cached object");
                    first_err.get_or_insert(e);
                    if ignore_errors {
                        continue;
                    }
                    break;
                }
            };

            let object = match Object::unmarshal(&data) {
                Ok(object) if object.address() == addr => object,
                Ok(_) | Err(_) => {
                    error!(%addr, "undecodable write-cache entry dropped");
                    self.evict(&addr);
                    res.dropped += 1;
                    continue;
                }
            };

            match target.flush(&object) {
                Ok(()) => {
                    self.failures.store(0, Ordering::Release);
                    self.evict(&addr);
                    res.flushed += 1;
                }
                Err(e) if e.is_not_found() => {
                    debug!(%addr, "flush target does not know the object, keeping it cached");
                    res.deferred += 1;
                }
                Err(e) => {
                    res.failed += 1;
                    let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                    if failures >= self.config.error_threshold
                        && !self.read_only.swap(true, Ordering::AcqRel)
                    {
                        error!(failures, error = %e, "write-cache switched to read-only");
                        res.persistent_failure = true;
                    }
                    first_err.get_or_insert(e);
                    if !ignore_errors {
                        break;
                    }
                }
            }
        }

        if res.flushed > 0 || res.failed > 0 {
            debug!(
                flushed = res.flushed,
                failed = res.failed,
                dropped = res.dropped,
                deferred = res.deferred,
                "write-cache flush pass"
            );
        }
        (res, first_err)
    }

    fn evict(&self, addr: &Address) {
        let mut pending = self.pending.lock();
        match self.tree.delete(addr, &[]) {
            Ok(_) => {
                pending.remove(addr);
            }
            Err(e) => warn!(%addr, error = %e, "failed to evict flushed object"),
        }
    }
}
