//! Block cache and self-modifying-code invalidation bookkeeping
//!
//! Maps location descriptors to compiled block descriptors, plus an
//! interval map from guest PC ranges to the descriptors covering them.
//! Patch-site bookkeeping lives here too: sites are registered under the
//! descriptor they target, so compiling a block patches every site waiting
//! for it and invalidating one unpatches them again. The cache never frees
//! code bytes; that happens only when the whole arena is reset.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::backend::PatchKind;
use crate::loc::LocationDescriptor;

/// A compiled block's runtime identity.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub entry: u64,
    pub size: usize,
    pub pc_range: (u64, u64),
    /// Targets of this block's outgoing patch sites, for unregistration.
    pub outgoing: Vec<(LocationDescriptor, u64)>,
}

/// A patchable site in emitted code referencing some target descriptor.
#[derive(Debug, Clone)]
pub struct PatchSite {
    pub addr: u64,
    pub kind: PatchKind,
    pub unpatched: Vec<u8>,
}

impl PatchSite {
    /// Byte image linking the site to `entry`.
    pub fn patched_bytes(&self, entry: u64) -> Vec<u8> {
        match self.kind {
            PatchKind::Jg => {
                let rel = entry as i64 - (self.addr as i64 + 6);
                let mut b = vec![0x0f, 0x8f];
                b.extend_from_slice(&(rel as i32).to_le_bytes());
                b
            }
            PatchKind::Jmp => {
                let rel = entry as i64 - (self.addr as i64 + 5);
                let mut b = vec![0xe9];
                b.extend_from_slice(&(rel as i32).to_le_bytes());
                b
            }
            PatchKind::Imm64 => entry.to_le_bytes().to_vec(),
        }
    }
}

/// Interval map from guest PC ranges to descriptors.
#[derive(Default)]
pub struct RangeMap {
    /// start -> [(end, descriptor)]
    by_start: BTreeMap<u64, Vec<(u64, LocationDescriptor)>>,
}

impl RangeMap {
    pub fn insert(&mut self, range: (u64, u64), desc: LocationDescriptor) {
        self.by_start.entry(range.0).or_default().push((range.1, desc));
    }

    pub fn remove(&mut self, range: (u64, u64), desc: LocationDescriptor) {
        if let Some(v) = self.by_start.get_mut(&range.0) {
            v.retain(|&(end, d)| !(end == range.1 && d == desc));
            if v.is_empty() {
                self.by_start.remove(&range.0);
            }
        }
    }

    /// All descriptors whose range overlaps [start, end).
    pub fn overlapping(&self, start: u64, end: u64) -> Vec<LocationDescriptor> {
        let mut out = Vec::new();
        for (_, entries) in self.by_start.range(..end) {
            for &(block_end, desc) in entries {
                if block_end > start {
                    out.push(desc);
                }
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.by_start.clear();
    }
}

/// The descriptor-keyed block cache.
#[derive(Default)]
pub struct BlockCache {
    blocks: FxHashMap<LocationDescriptor, BlockDescriptor>,
    ranges: RangeMap,
    /// Patchable sites waiting on (or linked to) each target descriptor.
    patch_sites: FxHashMap<LocationDescriptor, Vec<PatchSite>>,
}

impl BlockCache {
    pub fn new() -> BlockCache {
        BlockCache::default()
    }

    pub fn get(&self, desc: LocationDescriptor) -> Option<&BlockDescriptor> {
        self.blocks.get(&desc)
    }

    pub fn contains(&self, desc: LocationDescriptor) -> bool {
        self.blocks.contains_key(&desc)
    }

    pub fn insert(&mut self, desc: LocationDescriptor, block: BlockDescriptor) {
        self.ranges.insert(block.pc_range, desc);
        self.blocks.insert(desc, block);
    }

    /// Register a patchable site targeting `target`.
    pub fn add_patch_site(&mut self, target: LocationDescriptor, site: PatchSite) {
        self.patch_sites.entry(target).or_default().push(site);
    }

    /// Sites referencing `target` (to patch on compile / unpatch on
    /// invalidate).
    pub fn sites_for(&self, target: LocationDescriptor) -> &[PatchSite] {
        self.patch_sites
            .get(&target)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Remove a block, returning it together with the sites that must be
    /// unpatched.
    pub fn remove(&mut self, desc: LocationDescriptor) -> Option<(BlockDescriptor, Vec<PatchSite>)> {
        let block = self.blocks.remove(&desc)?;
        self.ranges.remove(block.pc_range, desc);
        // Unregister this block's own outgoing sites: they live in code
        // that is no longer reachable
        for (target, addr) in &block.outgoing {
            if let Some(sites) = self.patch_sites.get_mut(target) {
                sites.retain(|s| s.addr != *addr);
            }
        }
        let to_unpatch = self.patch_sites.get(&desc).cloned().unwrap_or_default();
        Some((block, to_unpatch))
    }

    /// Descriptors overlapping any of the given guest ranges.
    pub fn overlapping_ranges(&self, ranges: &[(u64, u64)]) -> Vec<LocationDescriptor> {
        let mut out = Vec::new();
        for &(start, end) in ranges {
            out.extend(self.ranges.overlapping(start, end));
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.ranges.clear();
        self.patch_sites.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(entry: u64, range: (u64, u64)) -> BlockDescriptor {
        BlockDescriptor {
            entry,
            size: 16,
            pc_range: range,
            outgoing: vec![],
        }
    }

    #[test]
    fn test_insert_and_get() {
        let mut cache = BlockCache::new();
        let d = LocationDescriptor(0x1000);
        cache.insert(d, block(0x5000, (0x1000, 0x1010)));
        assert_eq!(cache.get(d).unwrap().entry, 0x5000);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_overlap_queries() {
        let mut cache = BlockCache::new();
        let a = LocationDescriptor(0x1000);
        let b = LocationDescriptor(0x2000);
        cache.insert(a, block(0x5000, (0x1000, 0x1010)));
        cache.insert(b, block(0x5100, (0x2000, 0x2010)));

        assert_eq!(cache.overlapping_ranges(&[(0x1008, 0x100c)]), vec![a]);
        assert_eq!(
            cache.overlapping_ranges(&[(0x0, 0x3000)]),
            vec![a, b]
        );
        assert!(cache.overlapping_ranges(&[(0x1010, 0x2000)]).is_empty());
        // Adjacent-before does not overlap
        assert!(cache.overlapping_ranges(&[(0xff0, 0x1000)]).is_empty());
    }

    #[test]
    fn test_remove_returns_waiting_sites() {
        let mut cache = BlockCache::new();
        let target = LocationDescriptor(0x1000);
        cache.insert(target, block(0x5000, (0x1000, 0x1010)));
        cache.add_patch_site(
            target,
            PatchSite {
                addr: 0x6000,
                kind: PatchKind::Jmp,
                unpatched: vec![0xe9, 0, 0, 0, 0],
            },
        );
        let (_, sites) = cache.remove(target).unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].addr, 0x6000);
        assert!(cache.get(target).is_none());
    }

    #[test]
    fn test_remove_unregisters_outgoing() {
        let mut cache = BlockCache::new();
        let a = LocationDescriptor(0x1000);
        let target = LocationDescriptor(0x2000);
        let mut blk = block(0x5000, (0x1000, 0x1010));
        blk.outgoing.push((target, 0x5004));
        cache.insert(a, blk);
        cache.add_patch_site(
            target,
            PatchSite {
                addr: 0x5004,
                kind: PatchKind::Jg,
                unpatched: vec![0x90; 6],
            },
        );
        cache.remove(a);
        assert!(cache.sites_for(target).is_empty());
    }

    #[test]
    fn test_patched_bytes_forms() {
        let site = PatchSite {
            addr: 0x1000,
            kind: PatchKind::Jmp,
            unpatched: vec![0xe9, 0, 0, 0, 0],
        };
        // jmp from 0x1000 to 0x2000: rel = 0x2000 - 0x1005
        let bytes = site.patched_bytes(0x2000);
        assert_eq!(bytes[0], 0xe9);
        assert_eq!(
            i32::from_le_bytes(bytes[1..5].try_into().unwrap()),
            0x2000 - 0x1005
        );

        let jg = PatchSite {
            addr: 0x1000,
            kind: PatchKind::Jg,
            unpatched: vec![0x90; 6],
        };
        let bytes = jg.patched_bytes(0x1000);
        assert_eq!(&bytes[..2], &[0x0f, 0x8f]);
        assert_eq!(i32::from_le_bytes(bytes[2..6].try_into().unwrap()), -6);

        let imm = PatchSite {
            addr: 0x1000,
            kind: PatchKind::Imm64,
            unpatched: vec![0; 8],
        };
        assert_eq!(imm.patched_bytes(0xdead), 0xdeadu64.to_le_bytes().to_vec());
    }
}
