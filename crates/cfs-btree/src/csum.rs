//! Data checksum store.
//!
//! One `CsumItem` per run of checksummed sectors, keyed by the physical
//! bytenr of its first sector. Deleting a range trims or splits the items
//! that overlap it.

use crate::items::CsumItem;
use crate::transaction::TransHandle;
use crate::{EXTENT_CSUM_OBJECTID, ItemReader, Key, TreeId, item_type, parse_to_cfs_error};
use cfs_error::Result;
use cfs_types::SectorSize;

fn csum_key(bytenr: u64) -> Key {
    Key::new(EXTENT_CSUM_OBJECTID, item_type::EXTENT_CSUM, bytenr)
}

/// Checksum items overlapping `[bytenr, end)`.
fn overlapping<R: ItemReader + ?Sized>(
    reader: &R,
    ss: SectorSize,
    bytenr: u64,
    end: u64,
) -> Result<Vec<(u64, CsumItem)>> {
    let mut out = Vec::new();
    if end <= bytenr {
        return Ok(out);
    }
    if let Some((key, data)) = reader.prev_item(TreeId::Csum, &csum_key(bytenr)) {
        if key.objectid == EXTENT_CSUM_OBJECTID && key.item_type == item_type::EXTENT_CSUM {
            let item = CsumItem::parse(&data).map_err(|e| parse_to_cfs_error(&e))?;
            let item_end = key.offset + item.sums.len() as u64 * ss.bytes();
            if item_end > bytenr {
                out.push((key.offset, item));
            }
        }
    }
    for (key, data) in reader.range_items(TreeId::Csum, &csum_key(bytenr + 1), &csum_key(end - 1)) {
        let item = CsumItem::parse(&data).map_err(|e| parse_to_cfs_error(&e))?;
        out.push((key.offset, item));
    }
    Ok(out)
}

/// Checksum for every sector of `[bytenr, bytenr + len)`; `None` where no
/// checksum is stored.
pub fn lookup_csums<R: ItemReader + ?Sized>(
    reader: &R,
    ss: SectorSize,
    bytenr: u64,
    len: u64,
) -> Result<Vec<Option<u32>>> {
    let sectors = usize::try_from(ss.sectors(len)).unwrap_or(usize::MAX);
    let mut out = vec![None; sectors];
    for (start, item) in overlapping(reader, ss, bytenr, bytenr.saturating_add(len))? {
        for (i, sum) in item.sums.iter().enumerate() {
            let sector = start + i as u64 * ss.bytes();
            if sector >= bytenr && sector < bytenr + len {
                let idx = usize::try_from((sector - bytenr) >> ss.shift()).unwrap_or(usize::MAX);
                if let Some(slot) = out.get_mut(idx) {
                    *slot = Some(*sum);
                }
            }
        }
    }
    Ok(out)
}

/// Whether any sector of the range has a stored checksum.
pub fn csum_exists<R: ItemReader + ?Sized>(
    reader: &R,
    ss: SectorSize,
    bytenr: u64,
    len: u64,
) -> Result<bool> {
    Ok(lookup_csums(reader, ss, bytenr, len)?
        .iter()
        .any(Option::is_some))
}

/// Store checksums for consecutive sectors starting at `bytenr`, replacing
/// any already stored for that range.
pub fn insert_csums(h: &mut TransHandle, ss: SectorSize, bytenr: u64, sums: &[u32]) -> Result<()> {
    if sums.is_empty() {
        return Ok(());
    }
    delete_csums(h, ss, bytenr, sums.len() as u64 * ss.bytes())?;
    h.insert(
        TreeId::Csum,
        csum_key(bytenr),
        CsumItem {
            sums: sums.to_vec(),
        }
        .encode(),
    )
}

/// Remove checksums for `[bytenr, bytenr + len)`.
pub fn delete_csums(h: &mut TransHandle, ss: SectorSize, bytenr: u64, len: u64) -> Result<()> {
    let end = bytenr.saturating_add(len);
    for (start, item) in overlapping(&*h, ss, bytenr, end)? {
        h.delete(TreeId::Csum, csum_key(start))?;
        let n = item.sums.len();
        let item_end = start + n as u64 * ss.bytes();
        if start < bytenr {
            let keep = usize::try_from((bytenr - start) >> ss.shift()).unwrap_or(n).min(n);
            h.update(
                TreeId::Csum,
                csum_key(start),
                CsumItem {
                    sums: item.sums[..keep].to_vec(),
                }
                .encode(),
            )?;
        }
        if item_end > end {
            let skip = usize::try_from((end - start) >> ss.shift()).unwrap_or(n).min(n);
            h.update(
                TreeId::Csum,
                csum_key(end),
                CsumItem {
                    sums: item.sums[skip..].to_vec(),
                }
                .encode(),
            )?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetadataStore, TransactionManager};
    use std::sync::Arc;

    const SS: u64 = 4096;

    fn mgr() -> TransactionManager {
        TransactionManager::new(Arc::new(MetadataStore::new()))
    }

    #[test]
    fn insert_then_lookup_per_sector() {
        let mgr = mgr();
        let ss = SectorSize::default();
        let mut h = mgr.start().expect("start");
        insert_csums(&mut h, ss, 1 << 20, &[1, 2, 3]).expect("insert");
        h.end().expect("end");
        let store = mgr.store();
        let got = lookup_csums(store.as_ref(), ss, (1 << 20) + SS, 3 * SS).expect("lookup");
        assert_eq!(got, vec![Some(2), Some(3), None]);
        assert!(csum_exists(store.as_ref(), ss, (1 << 20) + 2 * SS, SS).expect("exists"));
        assert!(!csum_exists(store.as_ref(), ss, (1 << 20) + 3 * SS, SS).expect("exists"));
    }

    #[test]
    fn delete_splits_items() {
        let mgr = mgr();
        let ss = SectorSize::default();
        let base = 1 << 20;
        let mut h = mgr.start().expect("start");
        insert_csums(&mut h, ss, base, &[10, 11, 12, 13]).expect("insert");
        delete_csums(&mut h, ss, base + SS, 2 * SS).expect("delete middle");
        let got = lookup_csums(&h, ss, base, 4 * SS).expect("lookup");
        assert_eq!(got, vec![Some(10), None, None, Some(13)]);
        h.end().expect("end");
        assert_eq!(mgr.store().item_count(TreeId::Csum), 2);
    }

    #[test]
    fn reinsert_replaces_old_sums() {
        let mgr = mgr();
        let ss = SectorSize::default();
        let base = 1 << 20;
        let mut h = mgr.start().expect("start");
        insert_csums(&mut h, ss, base, &[1, 1]).expect("first");
        insert_csums(&mut h, ss, base + SS, &[2, 2]).expect("second");
        let got = lookup_csums(&h, ss, base, 3 * SS).expect("lookup");
        assert_eq!(got, vec![Some(1), Some(2), Some(2)]);
        h.end().expect("end");
    }
}
