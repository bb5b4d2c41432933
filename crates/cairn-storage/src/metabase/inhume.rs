use super::{Grave, Metabase, counters, is_removed, keys, record};
use cairn_common::{Address, Epoch, Error, ObjectType, Result};
use tracing::debug;

/// What logically removes the members
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InhumeTarget {
    /// A tombstone object; graves expire together with it
    Tombstone { address: Address, expiration: Epoch },
    /// A garbage mark, collected by the garbage remover
    Garbage,
}

/// Parameters of [`Metabase::inhume`]
#[derive(Clone, Debug)]
pub struct InhumePrm {
    pub target: InhumeTarget,
    pub addresses: Vec<Address>,
}

impl InhumePrm {
    pub fn tombstone(tombstone: Address, expiration: Epoch, addresses: Vec<Address>) -> Self {
        Self {
            target: InhumeTarget::Tombstone {
                address: tombstone,
                expiration,
            },
            addresses,
        }
    }

    pub fn garbage(addresses: Vec<Address>) -> Self {
        Self {
            target: InhumeTarget::Garbage,
            addresses,
        }
    }
}

/// Result of [`Metabase::inhume`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InhumeRes {
    /// Members that were available before the call
    pub available_removed: u64,
}

impl Metabase {
    /// Logically remove objects without touching their payloads
    ///
    /// Absent members are skipped. Members removed before are not counted
    /// twice. Removing a lock object with a tombstone fails with
    /// `LockObjectRemoval` and leaves the index unchanged.
    pub fn inhume(&self, prm: &InhumePrm) -> Result<InhumeRes> {
        self.update(|txn| {
            let mut res = InhumeRes::default();
            for addr in &prm.addresses {
                let Some(rec) = record(txn, addr)? else {
                    continue;
                };

                let was_removed = is_removed(txn, addr);
                match prm.target {
                    InhumeTarget::Tombstone {
                        address,
                        expiration,
                    } => {
                        if rec.header.object_type == ObjectType::Lock {
                            return Err(Error::LockObjectRemoval(*addr));
                        }
                        let grave = Grave {
                            tombstone: address,
                            expiration,
                        };
                        txn.put(keys::graveyard(addr), grave.encode()?);
                    }
                    InhumeTarget::Garbage => {
                        txn.put(keys::garbage(addr), Vec::new());
                    }
                }

                if !was_removed {
                    res.available_removed += 1;
                }
            }

            let removed = i64::try_from(res.available_removed)
                .map_err(|_| Error::internal("inhume batch too large"))?;
            counters::adjust(txn, 0, -removed);
            debug!(
                members = prm.addresses.len(),
                removed = res.available_removed,
                "objects inhumed"
            );
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::ObjectCounters;
    use super::super::test_util::*;
    use super::*;
    use cairn_common::{ContainerId, Lock, Object, OwnerId};
    use tempfile::tempdir;

    #[test]
    fn test_inhume_idempotent() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let obj = object(cid);
        put(&mb, &obj);

        let prm = InhumePrm::tombstone(object(cid).address(), 100, vec![obj.address()]);
        assert_eq!(mb.inhume(&prm).unwrap().available_removed, 1);
        assert_eq!(mb.inhume(&prm).unwrap().available_removed, 0);

        // A garbage mark over a grave does not count either.
        let res = mb.inhume(&InhumePrm::garbage(vec![obj.address()])).unwrap();
        assert_eq!(res.available_removed, 0);
        assert_eq!(mb.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 0 });
    }

    #[test]
    fn test_inhume_absent_member_is_noop() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let ghost = object(cid);

        let prm = InhumePrm::tombstone(object(cid).address(), 100, vec![ghost.address()]);
        assert_eq!(mb.inhume(&prm).unwrap().available_removed, 0);
        assert!(mb.expired_graves(u64::MAX).unwrap().is_empty());

        // No grave means the address can still be written.
        assert!(mb.put(&ghost.header, None).unwrap().inserted);
    }

    #[test]
    fn test_tombstone_cannot_remove_lock() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let regular = object(cid);
        let lock = Object::lock(cid, OwnerId::random(), &Lock::default()).unwrap();
        put(&mb, &regular);
        put(&mb, &lock);

        let prm = InhumePrm::tombstone(
            object(cid).address(),
            100,
            vec![regular.address(), lock.address()],
        );
        assert!(matches!(
            mb.inhume(&prm),
            Err(Error::LockObjectRemoval(_))
        ));
        // Whole batch rejected.
        assert!(mb.exists(&regular.address()).unwrap());

        let res = mb.inhume(&InhumePrm::garbage(vec![lock.address()])).unwrap();
        assert_eq!(res.available_removed, 1);
    }
}
