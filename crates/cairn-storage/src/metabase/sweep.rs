//! Index scans feeding the garbage collector

use super::{Grave, Metabase, is_locked, keys};
use cairn_common::{Address, Epoch, ObjectType, Result};

/// Entry of the expiration index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExpiredObject {
    pub address: Address,
    pub object_type: ObjectType,
}

impl Metabase {
    /// Objects whose expiration epoch is strictly below `epoch`
    ///
    /// Lock protection is not considered here; deletes re-check it.
    pub fn expired_objects(&self, epoch: Epoch) -> Result<Vec<ExpiredObject>> {
        self.view(|r| {
            let mut found = Vec::new();
            r.scan_range(
                &[keys::EXPIRATION],
                Some(&keys::expiration_before(epoch)),
                &mut |k, v| {
                    if let Some((_, address)) = keys::address_after_epoch(k)
                        && let Some(object_type) = v.first().copied().and_then(ObjectType::from_u8)
                    {
                        found.push(ExpiredObject {
                            address,
                            object_type,
                        });
                    }
                    true
                },
            );
            Ok(found)
        })
    }

    /// Graveyard entries whose tombstone expired before `epoch`
    pub fn expired_graves(&self, epoch: Epoch) -> Result<Vec<(Address, Grave)>> {
        self.view(|r| {
            let mut found = Vec::new();
            let mut err = None;
            r.scan_prefix(&[keys::GRAVEYARD], &mut |k, v| {
                let Some(addr) = keys::address_after_prefix(k) else {
                    return true;
                };
                match Grave::decode(v) {
                    Ok(grave) => {
                        if grave.expiration < epoch {
                            found.push((addr, grave));
                        }
                        true
                    }
                    Err(e) => {
                        err = Some(e);
                        false
                    }
                }
            });
            err.map_or(Ok(found), Err)
        })
    }

    /// Forget graveyard entries
    pub fn drop_graves(&self, addrs: &[Address]) -> Result<()> {
        if addrs.is_empty() {
            return Ok(());
        }
        self.update(|txn| {
            for addr in addrs {
                txn.delete(keys::graveyard(addr));
            }
            Ok(())
        })
    }

    /// Up to `limit` garbage-marked addresses not protected by a lock
    pub fn garbage(&self, limit: usize) -> Result<Vec<Address>> {
        self.view(|r| {
            let mut found = Vec::new();
            if limit == 0 {
                return Ok(found);
            }
            let mut marked = Vec::new();
            r.scan_prefix(&[keys::GARBAGE], &mut |k, _| {
                if let Some(addr) = keys::address_after_prefix(k) {
                    marked.push(addr);
                }
                true
            });
            found.extend(marked.into_iter().filter(|a| !is_locked(r, a)).take(limit));
            Ok(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::InhumePrm;
    use super::super::test_util::*;
    use super::*;
    use cairn_common::{ContainerId, ObjectId};
    use tempfile::tempdir;

    #[test]
    fn test_expired_objects_boundary() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let early = object(cid).with_expiration(10);
        let late = object(cid).with_expiration(20);
        put(&mb, &early);
        put(&mb, &late);
        put(&mb, &object(cid));

        assert!(mb.expired_objects(10).unwrap().is_empty());
        let expired = mb.expired_objects(11).unwrap();
        assert_eq!(
            expired,
            vec![ExpiredObject {
                address: early.address(),
                object_type: ObjectType::Regular
            }]
        );
        assert_eq!(mb.expired_objects(21).unwrap().len(), 2);
    }

    #[test]
    fn test_expired_graves_and_drop() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let a = object(cid);
        let b = object(cid);
        put(&mb, &a);
        put(&mb, &b);
        let ts_short = object(cid).address();
        let ts_long = object(cid).address();
        mb.inhume(&InhumePrm::tombstone(ts_short, 12, vec![a.address()]))
            .unwrap();
        mb.inhume(&InhumePrm::tombstone(ts_long, 50, vec![b.address()]))
            .unwrap();

        let graves = mb.expired_graves(13).unwrap();
        assert_eq!(graves.len(), 1);
        assert_eq!(graves[0].0, a.address());
        assert_eq!(graves[0].1.tombstone, ts_short);

        mb.drop_graves(&[a.address()]).unwrap();
        assert!(mb.expired_graves(13).unwrap().is_empty());
        assert_eq!(mb.expired_graves(u64::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_garbage_limit() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let objs: Vec<_> = (0..5).map(|_| object(cid)).collect();
        for o in &objs {
            put(&mb, o);
        }
        mb.inhume(&InhumePrm::garbage(objs.iter().map(|o| o.address()).collect()))
            .unwrap();

        assert_eq!(mb.garbage(3).unwrap().len(), 3);
        assert_eq!(mb.garbage(100).unwrap().len(), 5);
        assert!(mb.garbage(0).unwrap().is_empty());

        mb.lock(cid, ObjectId::random(), &[objs[0].header.id]).unwrap();
        assert_eq!(mb.garbage(100).unwrap().len(), 4);
        assert!(!mb.garbage(100).unwrap().contains(&objs[0].address()));

        mb.delete(&mb.garbage(100).unwrap(), false).unwrap();
        assert!(mb.garbage(100).unwrap().is_empty());
    }
}
