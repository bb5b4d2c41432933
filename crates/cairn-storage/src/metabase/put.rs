use super::{IndexRecord, Metabase, counters, keys, record};
use crate::index::KvRead;
use cairn_common::{Error, ObjectHeader, Result};
use tracing::debug;

/// Result of [`Metabase::put`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PutRes {
    /// A new entry was created (counters changed)
    pub inserted: bool,
}

impl Metabase {
    /// Index an object
    ///
    /// An existing entry only gets its storage descriptor refreshed. Fails
    /// with `AlreadyRemoved` for addresses covered by a tombstone and with
    /// `Expired` when the object's expiration epoch has passed.
    pub fn put(&self, header: &ObjectHeader, storage_id: Option<Vec<u8>>) -> Result<PutRes> {
        let addr = header.address();
        let epoch = self.current_epoch();

        self.update(|txn| {
            if txn.contains(&keys::graveyard(&addr)) {
                return Err(Error::AlreadyRemoved(addr));
            }

            if let Some(mut existing) = record(txn, &addr)? {
                if storage_id.is_some() && existing.storage_id != storage_id {
                    existing.storage_id = storage_id;
                    txn.put(keys::primary(&addr), existing.encode()?);
                }
                return Ok(PutRes { inserted: false });
            }

            if header.expiration.is_some_and(|e| e < epoch) {
                return Err(Error::Expired(addr));
            }

            let rec = IndexRecord {
                header: header.clone(),
                storage_id,
            };
            txn.put(keys::primary(&addr), rec.encode()?);
            if let Some(exp) = header.expiration {
                txn.put(
                    keys::expiration(exp, &addr),
                    vec![header.object_type.as_u8()],
                );
            }

            let logic = i64::from(!txn.contains(&keys::garbage(&addr)));
            counters::adjust(txn, 1, logic);
            debug!(%addr, "object indexed");
            Ok(PutRes { inserted: true })
        })
    }
}
