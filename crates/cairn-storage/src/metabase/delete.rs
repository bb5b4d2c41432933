use super::{Metabase, counters, is_locked, is_removed, keys, record};
use crate::index::{KvRead, Txn};
use cairn_common::{Address, Error, ObjectType, Result};
use tracing::debug;

/// Result of [`Metabase::delete`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteRes {
    /// Entries physically removed
    pub raw_removed: u64,
    /// Removed entries that were not logically removed before
    pub available_removed: u64,
    /// Removed payload size per requested address, zero when nothing was removed
    pub sizes: Vec<u64>,
    /// Removed addresses with their storage descriptors
    pub removed: Vec<(Address, Option<Vec<u8>>)>,
    /// Addresses left in place because a lock protects them
    pub skipped: Vec<Address>,
}

impl Metabase {
    /// Physically remove index entries
    ///
    /// Absent addresses are no-ops. With `skip_locked` the lock check and
    /// the removal happen in the same transaction, so protection added
    /// before the call is always honored.
    pub fn delete(&self, addrs: &[Address], skip_locked: bool) -> Result<DeleteRes> {
        self.update(|txn| {
            let mut res = DeleteRes::default();
            for addr in addrs {
                if skip_locked && is_locked(txn, addr) {
                    res.skipped.push(*addr);
                    res.sizes.push(0);
                    continue;
                }

                let Some(rec) = record(txn, addr)? else {
                    txn.delete(keys::garbage(addr));
                    res.sizes.push(0);
                    continue;
                };

                if !is_removed(txn, addr) {
                    res.available_removed += 1;
                }
                res.raw_removed += 1;

                txn.delete(keys::primary(addr));
                txn.delete(keys::garbage(addr));
                if let Some(exp) = rec.header.expiration {
                    txn.delete(keys::expiration(exp, addr));
                }
                drop_member_relations(txn, addr);
                if rec.header.object_type == ObjectType::Lock {
                    drop_locker_relations(txn, addr);
                }

                res.sizes.push(rec.header.payload_size);
                res.removed.push((*addr, rec.storage_id));
            }

            let (raw, available) = (
                i64::try_from(res.raw_removed),
                i64::try_from(res.available_removed),
            );
            let (Ok(raw), Ok(available)) = (raw, available) else {
                return Err(Error::internal("delete batch too large"));
            };
            counters::adjust(txn, -raw, -available);

            debug!(
                requested = addrs.len(),
                removed = res.raw_removed,
                skipped = res.skipped.len(),
                "index entries deleted"
            );
            Ok(res)
        })
    }
}

/// Remove every `member → locker` relation of `member` and its mirror
fn drop_member_relations(txn: &mut Txn<'_>, member: &Address) {
    let relations = txn.collect_prefix(&keys::locked_prefix(member));
    for (key, _) in relations {
        if let Some(locker) = keys::trailing_object(&key) {
            let locker = Address::new(member.container, locker);
            txn.delete(keys::lockers(&locker, &member.object));
        }
        txn.delete(key);
    }
}

/// Remove every `locker → member` relation of `locker` and its mirror
///
/// Returns the members that no longer have any locker.
pub(crate) fn drop_locker_relations(txn: &mut Txn<'_>, locker: &Address) -> Vec<Address> {
    let relations = txn.collect_prefix(&keys::lockers_prefix(locker));
    let mut unlocked = Vec::new();
    for (key, _) in relations {
        if let Some(member) = keys::trailing_object(&key) {
            let member = Address::new(locker.container, member);
            txn.delete(keys::locked(&member, &locker.object));
            if !is_locked(txn, &member) {
                unlocked.push(member);
            }
        }
        txn.delete(key);
    }
    unlocked
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::super::{InhumePrm, ObjectCounters};
    use super::*;
    use cairn_common::ContainerId;
    use tempfile::tempdir;

    #[test]
    fn test_delete_idempotent() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let a = object(cid);
        let b = object(cid);
        put(&mb, &a);
        put(&mb, &b);

        let first = mb.delete(&[a.address()], false).unwrap();
        assert_eq!(first.raw_removed, 1);
        assert_eq!(first.sizes, vec![10]);
        assert_eq!(first.removed, vec![(a.address(), Some(vec![0]))]);
        let after_first = mb.object_counters().unwrap();

        let second = mb.delete(&[a.address()], false).unwrap();
        assert_eq!(second.raw_removed, 0);
        assert_eq!(second.sizes, vec![0]);
        assert_eq!(mb.object_counters().unwrap(), after_first);
        assert_eq!(after_first, ObjectCounters { phy: 1, logic: 1 });
    }

    #[test]
    fn test_delete_duplicate_addresses() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let obj = object(ContainerId::random());
        put(&mb, &obj);

        let res = mb.delete(&[obj.address(), obj.address()], false).unwrap();
        assert_eq!(res.raw_removed, 1);
        assert_eq!(res.sizes, vec![10, 0]);
        assert_eq!(mb.object_counters().unwrap(), ObjectCounters::default());
    }

    #[test]
    fn test_delete_inhumed_only_decrements_phy() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let obj = object(cid);
        put(&mb, &obj);
        put(&mb, &object(cid));
        mb.inhume(&InhumePrm::tombstone(object(cid).address(), 5, vec![obj.address()]))
            .unwrap();

        let res = mb.delete(&[obj.address()], false).unwrap();
        assert_eq!(res.raw_removed, 1);
        assert_eq!(res.available_removed, 0);
        assert_eq!(mb.object_counters().unwrap(), ObjectCounters { phy: 1, logic: 1 });
    }

    #[test]
    fn test_delete_skip_locked() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let obj = object(cid);
        put(&mb, &obj);
        mb.lock(cid, object(cid).header.id, &[obj.header.id]).unwrap();

        let res = mb.delete(&[obj.address()], true).unwrap();
        assert_eq!(res.skipped, vec![obj.address()]);
        assert_eq!(res.raw_removed, 0);
        assert!(mb.exists(&obj.address()).unwrap());

        // Without the check the entry and its lock relations go away.
        mb.delete(&[obj.address()], false).unwrap();
        assert!(!mb.is_locked(&obj.address()).unwrap());
    }
}
