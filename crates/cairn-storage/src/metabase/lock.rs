use super::delete::drop_locker_relations;
use super::{Metabase, is_locked, keys, record};
use cairn_common::{Address, ContainerId, Error, ObjectId, ObjectType, Result};
use tracing::debug;

impl Metabase {
    /// Protect `members` of `cid` with the lock object `locker`
    ///
    /// Members do not have to be indexed yet. An indexed member that is not
    /// a regular object fails the whole call with `LockNonRegular`.
    pub fn lock(&self, cid: ContainerId, locker: ObjectId, members: &[ObjectId]) -> Result<()> {
        let locker_addr = Address::new(cid, locker);
        self.update(|txn| {
            for member in members {
                let addr = Address::new(cid, *member);
                if let Some(rec) = record(txn, &addr)?
                    && rec.header.object_type != ObjectType::Regular
                {
                    return Err(Error::LockNonRegular(addr));
                }
                txn.put(keys::locked(&addr, &locker), Vec::new());
                txn.put(keys::lockers(&locker_addr, member), Vec::new());
            }
            debug!(locker = %locker_addr, members = members.len(), "objects locked");
            Ok(())
        })
    }

    /// Whether any lock protects `addr`
    pub fn is_locked(&self, addr: &Address) -> Result<bool> {
        self.view(|r| Ok(is_locked(r, addr)))
    }

    /// Drop the relations held by the given lock objects
    ///
    /// Returns the members left without any lock. The lock entries
    /// themselves are not removed.
    pub fn free_locked_by(&self, lockers: &[Address]) -> Result<Vec<Address>> {
        self.update(|txn| {
            let mut unlocked = Vec::new();
            for locker in lockers {
                unlocked.extend(drop_locker_relations(txn, locker));
            }
            unlocked.sort();
            unlocked.dedup();
            Ok(unlocked)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use super::*;
    use cairn_common::{Lock, Object, OwnerId};
    use tempfile::tempdir;

    #[test]
    fn test_lock_and_free() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let obj = object(cid);
        put(&mb, &obj);

        let first = ObjectId::random();
        let second = ObjectId::random();
        mb.lock(cid, first, &[obj.header.id]).unwrap();
        mb.lock(cid, second, &[obj.header.id]).unwrap();
        assert!(mb.is_locked(&obj.address()).unwrap());

        // Still held by the second locker.
        let freed = mb.free_locked_by(&[Address::new(cid, first)]).unwrap();
        assert!(freed.is_empty());
        assert!(mb.is_locked(&obj.address()).unwrap());

        let freed = mb.free_locked_by(&[Address::new(cid, second)]).unwrap();
        assert_eq!(freed, vec![obj.address()]);
        assert!(!mb.is_locked(&obj.address()).unwrap());
    }

    #[test]
    fn test_lock_absent_member() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let later = object(cid);

        mb.lock(cid, ObjectId::random(), &[later.header.id]).unwrap();
        put(&mb, &later);
        assert!(mb.is_locked(&later.address()).unwrap());
    }

    #[test]
    fn test_lock_non_regular() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let regular = object(cid);
        let lock = Object::lock(cid, OwnerId::random(), &Lock::default()).unwrap();
        put(&mb, &regular);
        put(&mb, &lock);

        let res = mb.lock(cid, ObjectId::random(), &[regular.header.id, lock.header.id]);
        assert!(matches!(res, Err(Error::LockNonRegular(a)) if a == lock.address()));
        assert!(!mb.is_locked(&regular.address()).unwrap());
    }

    #[test]
    fn test_deleting_lock_object_frees_members() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let obj = object(cid);
        put(&mb, &obj);
        let lock = Object::lock(
            cid,
            OwnerId::random(),
            &Lock {
                members: vec![obj.header.id],
            },
        )
        .unwrap();
        put(&mb, &lock);
        mb.lock(cid, lock.header.id, &[obj.header.id]).unwrap();

        mb.delete(&[lock.address()], false).unwrap();
        assert!(!mb.is_locked(&obj.address()).unwrap());
    }
}
