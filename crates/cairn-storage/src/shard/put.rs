use super::flush::payload_delta;
use super::{Shard, writable};
use crate::metabase::PutRes;
use cairn_common::{Object, Result};
use tracing::{debug, warn};

impl Shard {
    /// Store an object
    ///
    /// The payload goes to the write-cache when it accepts the object and
    /// to the blob store otherwise; the metabase entry is written last.
    /// Refused with `ReadOnly` unless the shard is in `ReadWrite`.
    pub fn put(&self, object: &Object) -> Result<PutRes> {
        object.validate()?;
        let inner = &self.inner;
        let mode = inner.mode.read();
        writable(*mode)?;

        let addr = object.address();
        let mut cached = false;
        if let Some(wc) = &inner.writecache {
            match wc.put(object) {
                Ok(()) => cached = true,
                Err(e) if e.is_cache_rejection() => debug!(%addr, reason = %e, "write-cache skipped"),
                Err(e) => warn!(%addr, error = %e, "can't put object to the write-cache"),
            }
        }
        let storage_id = if cached {
            None
        } else {
            Some(inner.blobstor.put(object).map_err(|e| inner.report(e))?)
        };

        let res = match inner.metabase.put(&object.header, storage_id) {
            Ok(res) => res,
            Err(e) => {
                // an unindexed cache entry would never be flushed
                if cached
                    && let Some(wc) = &inner.writecache
                    && let Err(e) = wc.delete(&addr)
                {
                    warn!(%addr, error = %e, "can't drop unindexed write-cache entry");
                }
                return Err(inner.report(e));
            }
        };
        if res.inserted {
            inner.metrics.add_payload_size(payload_delta(object));
            inner.update_metrics();
        }
        Ok(res)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::*;
    use crate::metabase::ObjectCounters;
    use cairn_common::{ContainerId, Error, Mode};
    use tempfile::tempdir;

    #[test]
    fn test_put_rejected_when_read_only() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), true);
        shard.set_mode(Mode::ReadOnly).unwrap();

        let obj = object(ContainerId::random());
        assert!(matches!(shard.put(&obj), Err(Error::ReadOnly)));
        assert!(shard.get(&obj.address()).unwrap_err().is_not_found());
        assert!(shard.inner.writecache.as_ref().unwrap().is_empty());
        assert!(
            shard
                .inner
                .blobstor
                .get(&obj.address(), None)
                .unwrap_err()
                .is_not_found()
        );
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters::default());
    }

    #[test]
    fn test_oversized_object_bypasses_cache() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path(), true);
        config.writecache.max_object_size = 256;
        config.writecache.flush_interval_ms = 3_600_000;
        let (shard, _) = start(config);

        let big = cairn_common::Object::new(
            ContainerId::random(),
            cairn_common::OwnerId::random(),
            cairn_common::ObjectType::Regular,
            vec![1u8; 1024],
        );
        shard.put(&big).unwrap();
        assert!(shard.inner.writecache.as_ref().unwrap().is_empty());
        assert!(shard.inner.metabase.storage_id(&big.address()).unwrap().is_some());
        assert_eq!(shard.get(&big.address()).unwrap(), big);
    }

    #[test]
    fn test_invalid_object_rejected() {
        let dir = tempdir().unwrap();
        let (shard, _) = open(dir.path(), false);
        let mut obj = object(ContainerId::random());
        obj.header.payload_size += 1;
        assert!(matches!(shard.put(&obj), Err(Error::Validation(_))));
        assert_eq!(shard.object_counters().unwrap(), ObjectCounters::default());
    }
}
