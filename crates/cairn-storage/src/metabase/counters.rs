//! Object counters

use super::{Metabase, is_removed, keys};
use crate::index::{KvRead, Txn};
use cairn_common::{Address, Result};
use tracing::debug;

/// Physical and logical object counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectCounters {
    /// Objects stored
    pub phy: u64,
    /// Objects stored and not logically removed
    pub logic: u64,
}

fn read_counter<R: KvRead + ?Sized>(r: &R, name: &[u8]) -> u64 {
    r.get(&keys::shard_info(name))
        .and_then(|v| keys::decode_u64(&v))
        .unwrap_or_default()
}

pub(crate) fn read_counters<R: KvRead + ?Sized>(r: &R) -> ObjectCounters {
    ObjectCounters {
        phy: read_counter(r, keys::PHY_COUNTER),
        logic: read_counter(r, keys::LOGIC_COUNTER),
    }
}

fn write_counters(txn: &mut Txn<'_>, c: ObjectCounters) {
    txn.put(keys::shard_info(keys::PHY_COUNTER), c.phy.to_le_bytes().to_vec());
    txn.put(
        keys::shard_info(keys::LOGIC_COUNTER),
        c.logic.to_le_bytes().to_vec(),
    );
}

/// Apply counter deltas inside a mutation; decrements saturate at zero
pub(crate) fn adjust(txn: &mut Txn<'_>, phy: i64, logic: i64) {
    if phy == 0 && logic == 0 {
        return;
    }
    let c = read_counters(txn);
    let apply = |v: u64, d: i64| {
        if d >= 0 {
            v.saturating_add(d.unsigned_abs())
        } else {
            v.saturating_sub(d.unsigned_abs())
        }
    };
    write_counters(
        txn,
        ObjectCounters {
            phy: apply(c.phy, phy),
            logic: apply(c.logic, logic),
        },
    );
}

impl Metabase {
    /// Persisted object counters
    pub fn object_counters(&self) -> Result<ObjectCounters> {
        self.view(|r| Ok(read_counters(r)))
    }

    /// Recompute counters from a full primary index scan
    ///
    /// Without `force` the scan is skipped while both counters are
    /// persisted.
    pub fn sync_counters(&self, force: bool) -> Result<ObjectCounters> {
        self.update(|txn| {
            if !force
                && txn.contains(&keys::shard_info(keys::PHY_COUNTER))
                && txn.contains(&keys::shard_info(keys::LOGIC_COUNTER))
            {
                return Ok(read_counters(txn));
            }

            let mut addrs = Vec::new();
            txn.scan_prefix(&[keys::PRIMARY], &mut |k, _| {
                if let Some(addr) = keys::address_after_prefix(k) {
                    addrs.push(addr);
                }
                true
            });
            let counters = count(txn, &addrs);
            write_counters(txn, counters);
            debug!(phy = counters.phy, logic = counters.logic, "synced object counters");
            Ok(counters)
        })
    }
}

fn count<R: KvRead + ?Sized>(r: &R, addrs: &[Address]) -> ObjectCounters {
    let logic = addrs.iter().filter(|a| !is_removed(r, a)).count() as u64;
    ObjectCounters {
        phy: addrs.len() as u64,
        logic,
    }
}
