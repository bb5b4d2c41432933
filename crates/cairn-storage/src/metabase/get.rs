use super::{IndexRecord, Metabase, Status, keys, record, status};
use cairn_common::{Address, Error, Result};

impl Metabase {
    /// Stored header and descriptor of an available object
    ///
    /// Logically removed entries are reported as `NotFound`; expired and
    /// unlocked ones as `Expired`.
    pub fn get(&self, addr: &Address) -> Result<IndexRecord> {
        let epoch = self.current_epoch();
        self.view(|r| match status(r, addr, epoch)? {
            (Status::Available, Some(rec)) => Ok(rec),
            (Status::Expired, _) => Err(Error::Expired(*addr)),
            _ => Err(Error::NotFound(*addr)),
        })
    }

    /// Whether an object is available
    ///
    /// Absent addresses give `Ok(false)`; removed ones `AlreadyRemoved`,
    /// expired ones `Expired`.
    pub fn exists(&self, addr: &Address) -> Result<bool> {
        let epoch = self.current_epoch();
        self.view(|r| match status(r, addr, epoch)?.0 {
            Status::Available => Ok(true),
            Status::Absent => Ok(false),
            Status::Removed => Err(Error::AlreadyRemoved(*addr)),
            Status::Expired => Err(Error::Expired(*addr)),
        })
    }

    /// Raw descriptor lookup that also sees logically removed entries
    ///
    /// `Ok(None)` means the entry exists but its payload location is
    /// unknown (write-cache).
    pub fn storage_id(&self, addr: &Address) -> Result<Option<Vec<u8>>> {
        self.view(|r| {
            record(r, addr)?
                .map(|rec| rec.storage_id)
                .ok_or(Error::NotFound(*addr))
        })
    }

    /// Record where the blob store placed an already indexed object
    pub fn update_storage_id(&self, addr: &Address, storage_id: Vec<u8>) -> Result<()> {
        self.update(|txn| {
            let mut rec = record(txn, addr)?.ok_or(Error::NotFound(*addr))?;
            if rec.storage_id.as_deref() != Some(storage_id.as_slice()) {
                rec.storage_id = Some(storage_id);
                txn.put(keys::primary(addr), rec.encode()?);
            }
            Ok(())
        })
    }
}
