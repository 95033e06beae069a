// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Swap-disk usage map and block geometry
//! OWNERS: @kernel-vm-team
//! PUBLIC API: SwapMap (alloc/free/geometry)
//! DEPENDS_ON: disk geometry constants
//! INVARIANTS: Block k lives at sector k * sectors_per_page; blocks are
//!             anonymous (no on-disk header)

/// Usage map for page-sized blocks on the swap disk.
pub(crate) struct SwapMap {
    used: Vec<bool>,
    pub sectors_per_page: usize,
    pub track_size: usize,
    pub blocks: usize,
}

impl SwapMap {
    /// Derives the block layout from the disk geometry. A fractional
    /// trailing block is not usable.
    pub fn new(page_size: usize, sector_size: usize, track_size: usize, tracks: usize) -> Self {
        let mut sectors_per_page = page_size / sector_size;
        if sectors_per_page == 0 {
            sectors_per_page = 1;
        } else if page_size % sector_size != 0 {
            sectors_per_page += 1;
        }
        let disk_bytes = sector_size * track_size * tracks;
        let blocks = disk_bytes / page_size;
        Self { used: vec![false; blocks], sectors_per_page, track_size, blocks }
    }

    /// Claims the lowest free block.
    pub fn alloc(&mut self) -> Option<usize> {
        let block = self.used.iter().position(|&u| !u)?;
        self.used[block] = true;
        Some(block)
    }

    pub fn free(&mut self, block: usize) {
        if let Some(slot) = self.used.get_mut(block) {
            *slot = false;
        }
    }

    pub fn free_count(&self) -> usize {
        self.used.iter().filter(|&&u| !u).count()
    }

    /// Converts a block number into (track, first sector, sector count).
    /// Blocks may straddle track boundaries.
    pub fn geometry(&self, block: usize) -> (usize, usize, usize) {
        let disk_sector = block * self.sectors_per_page;
        let track = disk_sector / self.track_size;
        let first = disk_sector - track * self.track_size;
        (track, first, self.sectors_per_page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout_matches_geometry() {
        // 4096-byte pages on 512-byte sectors: 8 sectors per block, two
        // blocks per 16-sector track.
        let map = SwapMap::new(4096, 512, 16, 4);
        assert_eq!(map.sectors_per_page, 8);
        assert_eq!(map.blocks, 8);
        assert_eq!(map.geometry(0), (0, 0, 8));
        assert_eq!(map.geometry(1), (0, 8, 8));
        assert_eq!(map.geometry(2), (1, 0, 8));
        assert_eq!(map.geometry(5), (2, 8, 8));
    }

    #[test]
    fn fractional_pages_round_up_to_whole_sectors() {
        let map = SwapMap::new(1000, 512, 16, 2);
        assert_eq!(map.sectors_per_page, 2);
    }

    #[test]
    fn alloc_takes_lowest_block_and_free_returns_it() {
        let mut map = SwapMap::new(4096, 512, 16, 2);
        assert_eq!(map.blocks, 4);
        assert_eq!(map.alloc(), Some(0));
        assert_eq!(map.alloc(), Some(1));
        map.free(0);
        assert_eq!(map.alloc(), Some(0));
        assert_eq!(map.free_count(), 1);
    }

    #[test]
    fn exhaustion_yields_none() {
        let mut map = SwapMap::new(4096, 512, 16, 1);
        assert_eq!(map.blocks, 2);
        assert!(map.alloc().is_some());
        assert!(map.alloc().is_some());
        assert_eq!(map.alloc(), None);
    }
}
