use super::{IndexRecord, Metabase, Status, keys, status};
use cairn_common::{Address, ContainerId, ObjectHeader, ObjectId, ObjectType, OwnerId, Result};
use uuid::Uuid;

/// Header predicate for [`Metabase::select`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectFilter {
    Type(ObjectType),
    Owner(OwnerId),
    Attribute { key: String, value: String },
    /// Objects without a parent
    Root,
    Parent(ObjectId),
    SplitId(Uuid),
}

impl SelectFilter {
    fn matches(&self, header: &ObjectHeader) -> bool {
        match self {
            Self::Type(t) => header.object_type == *t,
            Self::Owner(o) => header.owner == *o,
            Self::Attribute { key, value } => header.attribute(key) == Some(value.as_str()),
            Self::Root => header.is_root(),
            Self::Parent(p) => header.parent == Some(*p),
            Self::SplitId(s) => header.split_id == Some(*s),
        }
    }
}

impl Metabase {
    /// Addresses of available objects in `cid` matching every filter
    pub fn select(&self, cid: ContainerId, filters: &[SelectFilter]) -> Result<Vec<Address>> {
        let epoch = self.current_epoch();
        self.view(|r| {
            let mut candidates = Vec::new();
            let mut decode_err = None;
            r.scan_prefix(&keys::primary_container(&cid), &mut |k, v| {
                let Some(addr) = keys::address_after_prefix(k) else {
                    return true;
                };
                match IndexRecord::decode(&addr, v) {
                    Ok(rec) => {
                        if filters.iter().all(|f| f.matches(&rec.header)) {
                            candidates.push(addr);
                        }
                        true
                    }
                    Err(e) => {
                        decode_err = Some(e);
                        false
                    }
                }
            });
            if let Some(e) = decode_err {
                return Err(e);
            }

            let mut found = Vec::with_capacity(candidates.len());
            for addr in candidates {
                if status(r, &addr, epoch)?.0 == Status::Available {
                    found.push(addr);
                }
            }
            Ok(found)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::InhumePrm;
    use super::super::test_util::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_select_by_attribute_and_type() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let tagged = object(cid).with_attribute("Color", "red");
        let plain = object(cid);
        let elsewhere = object(ContainerId::random()).with_attribute("Color", "red");
        for o in [&tagged, &plain, &elsewhere] {
            put(&mb, o);
        }

        let red = SelectFilter::Attribute {
            key: "Color".into(),
            value: "red".into(),
        };
        assert_eq!(mb.select(cid, &[red.clone()]).unwrap(), vec![tagged.address()]);

        let mut all = mb.select(cid, &[SelectFilter::Type(ObjectType::Regular)]).unwrap();
        all.sort();
        let mut expected = vec![tagged.address(), plain.address()];
        expected.sort();
        assert_eq!(all, expected);

        assert!(mb.select(cid, &[red, SelectFilter::Type(ObjectType::Lock)]).unwrap().is_empty());
    }

    #[test]
    fn test_select_skips_removed_and_expired() {
        let dir = tempdir().unwrap();
        let (mb, epoch) = open(dir.path());
        let cid = ContainerId::random();
        let alive = object(cid);
        let removed = object(cid);
        let expiring = object(cid).with_expiration(10);
        for o in [&alive, &removed, &expiring] {
            put(&mb, o);
        }
        mb.inhume(&InhumePrm::garbage(vec![removed.address()])).unwrap();
        epoch.set(11);

        assert_eq!(mb.select(cid, &[]).unwrap(), vec![alive.address()]);
    }

    #[test]
    fn test_select_split_hierarchy() {
        let dir = tempdir().unwrap();
        let (mb, _) = open(dir.path());
        let cid = ContainerId::random();
        let parent = ObjectId::random();
        let split = Uuid::new_v4();
        let child = object(cid).with_parent(parent, split);
        let root = object(cid);
        put(&mb, &child);
        put(&mb, &root);

        assert_eq!(mb.select(cid, &[SelectFilter::Root]).unwrap(), vec![root.address()]);
        assert_eq!(
            mb.select(cid, &[SelectFilter::Parent(parent)]).unwrap(),
            vec![child.address()]
        );
        assert_eq!(
            mb.select(cid, &[SelectFilter::SplitId(split)]).unwrap(),
            vec![child.address()]
        );
    }
}
