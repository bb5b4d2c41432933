//! Garbage collector
//!
//! Two workers per shard:
//! - the epoch worker runs the expired-object, expired-tombstone and
//!   expired-lock handlers concurrently for every new epoch
//! - the remover deletes garbage-marked objects every `remover_interval`
//!
//! A new epoch that arrives while a pass is running is dropped.

use super::{Shard, ShardInner};
use cairn_common::config::GcConfig;
use cairn_common::{Address, Epoch, Mode, ObjectType};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GcState {
    Idle,
    Running(Epoch),
}

struct GcShared {
    config: GcConfig,
    state: Mutex<GcState>,
}

impl GcShared {
    /// Move to `Running(epoch)`; `false` when a pass is already running
    fn begin(&self, epoch: Epoch) -> bool {
        let mut state = self.state.lock();
        if let GcState::Running(running) = *state {
            warn!(running, epoch, "previous GC pass is not finished, new epoch dropped");
            return false;
        }
        *state = GcState::Running(epoch);
        true
    }

    fn finish(&self) {
        *self.state.lock() = GcState::Idle;
    }

    fn run(&self, shard: &ShardInner, epoch: Epoch) {
        let batch = self.config.expired_batch_size.max(1);
        debug!(epoch, "GC pass started");
        thread::scope(|s| {
            s.spawn(|| shard.collect_expired_objects(epoch, batch));
            s.spawn(|| shard.collect_expired_tombstones(epoch, batch));
            s.spawn(|| shard.collect_expired_locks(epoch, batch));
        });
        debug!(epoch, "GC pass finished");
    }
}

pub(super) struct Gc {
    shared: Arc<GcShared>,
    events: Mutex<Option<Sender<Epoch>>>,
    stop: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Gc {
    pub(super) fn new(config: GcConfig) -> Self {
        Self {
            shared: Arc::new(GcShared {
                config,
                state: Mutex::new(GcState::Idle),
            }),
            events: Mutex::new(None),
            stop: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn start(&self, shard: Weak<ShardInner>) {
        self.stop();
        let (event_tx, event_rx) = unbounded::<Epoch>();
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let shared = Arc::clone(&self.shared);
        let weak = shard.clone();
        let epoch_worker = thread::spawn(move || epoch_loop(&shared, &weak, &event_rx));

        let shared = Arc::clone(&self.shared);
        let remover = thread::spawn(move || remover_loop(&shared, &shard, &stop_rx));

        *self.events.lock() = Some(event_tx);
        *self.stop.lock() = Some(stop_tx);
        *self.workers.lock() = vec![epoch_worker, remover];
    }

    /// Hand an epoch to the epoch worker
    pub(super) fn notify(&self, epoch: Epoch) {
        let events = self.events.lock();
        let Some(events) = events.as_ref() else {
            debug!(epoch, "GC is not running, epoch ignored");
            return;
        };
        if self.shared.begin(epoch) && events.send(epoch).is_err() {
            self.shared.finish();
        }
    }

    pub(super) fn stop(&self) {
        // dropping the sender ends the epoch worker
        self.events.lock().take();
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
        for worker in self.workers.lock().drain(..) {
            if worker.join().is_err() {
                error!("GC worker panicked");
            }
        }
    }
}

impl Drop for Gc {
    fn drop(&mut self) {
        self.stop();
    }
}

fn epoch_loop(shared: &GcShared, shard: &Weak<ShardInner>, events: &Receiver<Epoch>) {
    debug!("GC epoch worker started");
    while let Ok(epoch) = events.recv() {
        if let Some(shard) = shard.upgrade() {
            shared.run(&shard, epoch);
        }
        shared.finish();
    }
    debug!("GC epoch worker stopped");
}

fn remover_loop(shared: &GcShared, shard: &Weak<ShardInner>, stop: &Receiver<()>) {
    let interval = Duration::from_millis(shared.config.remover_interval_ms.max(1));
    let batch = shared.config.remover_batch_size.max(1);
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(shard) = shard.upgrade() else {
            break;
        };
        shard.remove_garbage(batch);
    }
    debug!("GC remover stopped");
}

impl Shard {
    /// Queue a new-epoch event for the garbage collector
    pub fn notify_new_epoch(&self, epoch: Epoch) {
        self.gc.notify(epoch);
    }

    /// Run a GC pass for `epoch` on the calling thread
    ///
    /// Returns `false` when another pass is running and the event was
    /// dropped.
    pub fn handle_new_epoch(&self, epoch: Epoch) -> bool {
        let shared = &self.gc.shared;
        if !shared.begin(epoch) {
            return false;
        }
        shared.run(&self.inner, epoch);
        shared.finish();
        true
    }

    /// Delete up to `limit` garbage-marked objects
    pub fn remove_garbage(&self, limit: usize) -> usize {
        self.inner.remove_garbage(limit)
    }
}

impl ShardInner {
    fn remove_garbage(&self, limit: usize) -> usize {
        let mode = self.mode.read();
        if *mode != Mode::ReadWrite {
            return 0;
        }
        let garbage = match self.metabase.garbage(limit) {
            Ok(garbage) => garbage,
            Err(e) => {
                warn!(error = %e, "iterator over garbage failed");
                return 0;
            }
        };
        if garbage.is_empty() {
            return 0;
        }
        match self.delete_objects(&garbage, true) {
            Ok(res) => {
                debug!(removed = res.raw_removed, "garbage removed");
                res.removed.len()
            }
            Err(e) => {
                warn!(error = %e, "could not delete the objects");
                0
            }
        }
    }

    fn collect_expired_objects(&self, epoch: Epoch, batch: usize) {
        let expired = match self.metabase.expired_objects(epoch) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(epoch, error = %e, "iterator over expired objects failed");
                return;
            }
        };
        let addrs: Vec<Address> = expired
            .into_iter()
            .filter(|o| o.object_type != ObjectType::Lock)
            .map(|o| o.address)
            .collect();

        let mut removed = 0usize;
        for chunk in addrs.chunks(batch) {
            let mode = self.mode.read();
            if *mode != Mode::ReadWrite {
                return;
            }
            match self.delete_objects(chunk, true) {
                Ok(res) => removed += res.removed.len(),
                Err(e) => {
                    warn!(epoch, error = %e, "could not inhume the objects");
                    return;
                }
            }
        }
        if removed > 0 {
            info!(epoch, removed, "expired objects collected");
        }
    }

    fn collect_expired_tombstones(&self, epoch: Epoch, batch: usize) {
        let graves = match self.metabase.expired_graves(epoch) {
            Ok(graves) => graves,
            Err(e) => {
                warn!(epoch, error = %e, "iterator over expired tombstones failed");
                return;
            }
        };

        let mut tombstones = BTreeSet::new();
        for chunk in graves.chunks(batch) {
            let mode = self.mode.read();
            if *mode != Mode::ReadWrite {
                return;
            }
            let members: Vec<Address> = chunk.iter().map(|(addr, _)| *addr).collect();
            let res = match self.delete_objects(&members, true) {
                Ok(res) => res,
                Err(e) => {
                    warn!(epoch, error = %e, "could not delete tombstoned objects");
                    return;
                }
            };
            // locked members keep their grave until the lock goes away
            let released: Vec<Address> = members
                .into_iter()
                .filter(|addr| !res.skipped.contains(addr))
                .collect();
            if let Err(e) = self.metabase.drop_graves(&released) {
                error!(epoch, error = %e, "could not drop expired graves");
                return;
            }
            tombstones.extend(chunk.iter().map(|(_, grave)| grave.tombstone));
        }

        let tombstones: Vec<Address> = tombstones.into_iter().collect();
        for chunk in tombstones.chunks(batch) {
            let mode = self.mode.read();
            if *mode != Mode::ReadWrite {
                return;
            }
            if let Err(e) = self.delete_objects(chunk, true) {
                warn!(epoch, error = %e, "could not delete expired tombstones");
                return;
            }
        }
        if !graves.is_empty() {
            info!(epoch, graves = graves.len(), tombstones = tombstones.len(), "expired tombstones collected");
        }
    }

    fn collect_expired_locks(&self, epoch: Epoch, batch: usize) {
        let expired = match self.metabase.expired_objects(epoch) {
            Ok(expired) => expired,
            Err(e) => {
                warn!(epoch, error = %e, "iterator over expired locks failed");
                return;
            }
        };
        let locks: Vec<Address> = expired
            .into_iter()
            .filter(|o| o.object_type == ObjectType::Lock)
            .map(|o| o.address)
            .collect();

        for chunk in locks.chunks(batch) {
            let mode = self.mode.read();
            if *mode != Mode::ReadWrite {
                return;
            }
            match self.metabase.free_locked_by(chunk) {
                Ok(unlocked) => debug!(epoch, unlocked = unlocked.len(), "expired locks released"),
                Err(e) => {
                    warn!(epoch, error = %e, "failure to unlock objects");
                    return;
                }
            }
            if let Err(e) = self.delete_objects(chunk, true) {
                warn!(epoch, error = %e, "could not delete expired lock objects");
                return;
            }
        }
        if !locks.is_empty() {
            info!(epoch, locks = locks.len(), "expired locks collected");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use crate::metabase::{InhumePrm, ObjectCounters};
    use cairn_common::{ContainerId, Lock, Object, ObjectId, OwnerId};
    use std::time::Instant;
    use tempfile::tempdir;

    #[test]
    fn test_tombstone_lifecycle() {
        let dir = tempdir().unwrap();
        let (shard, epoch) = open(dir.path(), false);
        let cid = ContainerId::random();
        let obj = object(cid);
        shard.put(&obj).unwrap();
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 1 });

        let tombstone = object(cid).address();
        shard
            .inhume(&InhumePrm::tombstone(tombstone, 15, vec![obj.address()]))
            .unwrap();
        assert!(shard.get(&obj.address()).unwrap_err().is_not_found());
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 0 });

        // graves survive while the tombstone is alive
        assert!(shard.handle_new_epoch(15));
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 0 });

        epoch.set(16);
        assert!(shard.handle_new_epoch(16));
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters::default());
        assert!(shard.inner.metabase.expired_graves(u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_expired_objects_collected() {
        let dir = tempdir().unwrap();
        let (shard, epoch) = open(dir.path(), false);
        let cid = ContainerId::random();
        let short = object(cid).with_expiration(11);
        let long = object(cid).with_expiration(100);
        shard.put(&short).unwrap();
        shard.put(&long).unwrap();

        epoch.set(12);
        assert!(shard.handle_new_epoch(12));
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 1 });
        assert!(
            shard
                .inner
                .blobstor
                .get(&short.address(), None)
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(shard.get(&long.address()).unwrap(), long);
    }

    #[test]
    fn test_locked_object_survives_gc() {
        let dir = tempdir().unwrap();
        let (shard, epoch) = open(dir.path(), false);
        let cid = ContainerId::random();
        let obj = object(cid).with_expiration(11);
        let buried = object(cid);
        shard.put(&obj).unwrap();
        shard.put(&buried).unwrap();

        let lock = Object::lock(
            cid,
            OwnerId::random(),
            &Lock {
                members: vec![obj.header.id, buried.header.id],
            },
        )
        .unwrap()
        .with_expiration(50);
        shard.put(&lock).unwrap();
        shard
            .lock(cid, lock.header.id, &[obj.header.id, buried.header.id])
            .unwrap();
        shard
            .inhume(&InhumePrm::tombstone(object(cid).address(), 11, vec![buried.address()]))
            .unwrap();

        epoch.set(20);
        assert!(shard.handle_new_epoch(20));
        assert_eq!(shard.get(&obj.address()).unwrap(), obj);
        assert_eq!(shard.object_counters().unwrap().phy, 3);
        // the grave stays while the lock protects the member
        assert_eq!(shard.inner.metabase.expired_graves(u64::MAX).unwrap().len(), 1);

        // lock expires: released in this pass, members collected in the next
        epoch.set(51);
        assert!(shard.handle_new_epoch(51));
        assert!(!shard.is_locked(&obj.address()).unwrap());
        assert!(shard.handle_new_epoch(52));
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters::default());
    }

    #[test]
    fn test_overlapping_epoch_dropped() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        assert!(shard.gc.shared.begin(30));
        assert!(!shard.handle_new_epoch(31));
        shard.gc.shared.finish();
        assert!(shard.handle_new_epoch(31));
    }

    #[test]
    fn test_background_workers() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), false);
        config.gc.remover_interval_ms = 10;
        let (shard, epoch) = start(config);
        let cid = ContainerId::random();
        let garbage = object(cid);
        let expiring = object(cid).with_expiration(10);
        let protected = object(cid);
        shard.put(&garbage).unwrap();
        shard.put(&expiring).unwrap();
        shard.put(&protected).unwrap();
        shard.lock(cid, ObjectId::random(), &[protected.header.id]).unwrap();
        shard
            .inhume(&InhumePrm::garbage(vec![garbage.address(), protected.address()]))
            .unwrap();

        epoch.set(11);
        shard.notify_new_epoch(11);

        let deadline = Instant::now() + Duration::from_secs(5);
        while shard.object_counters().unwrap().phy > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 0 });
        assert!(shard.is_locked(&protected.address()).unwrap());
        shard.close().unwrap();
    }
}
