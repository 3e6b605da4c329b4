//! Free-space allocation over a linear, optionally growable address space.
//!
//! Addresses are unit-agnostic. Callers that back a file with fixed-size
//! blocks scale every value by their block size.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Errors from sector allocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SectorError {
    #[error("no valid sector: {0}")]
    NoValidSector(&'static str),
    #[error("cannot reserve a sector with zero length")]
    InvalidLength,
    #[error("invalid region: stop {stop} is before start {start}")]
    InvalidRegion { start: u64, stop: u64 },
    #[error("sector {0:?} is not reserved")]
    NotReserved(Sector),
}

/// A half-open interval `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Sector {
    pub start: u64,
    pub stop: u64,
}

impl Sector {
    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }

    pub fn length(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    /// Do the two sectors overlap.
    pub fn intersects(&self, other: &Sector) -> bool {
        !(other.stop <= self.start || self.stop <= other.start)
    }

    /// Is `other` entirely within this sector.
    pub fn contains(&self, other: &Sector) -> bool {
        self.start <= other.start && other.stop <= self.stop
    }

    /// Do the two sectors touch without overlapping.
    pub fn neighbours(&self, other: &Sector) -> bool {
        other.stop == self.start || self.stop == other.start
    }

    /// The 0-2 pieces of this sector left over after removing `other`.
    ///
    /// `other` must be contained within this sector.
    pub fn split(&self, other: &Sector) -> Vec<Sector> {
        let mut pieces = Vec::with_capacity(2);
        if self.start < other.start {
            pieces.push(Sector::new(self.start, other.start));
        }
        if other.stop < self.stop {
            pieces.push(Sector::new(other.stop, self.stop));
        }
        pieces
    }
}

#[derive(Debug)]
struct SectorState {
    stop: u64,
    /// Free sectors keyed by start.
    free_by_start: BTreeMap<u64, Sector>,
    /// Free sectors ordered by (length, start) for best-fit search.
    free_by_size: BTreeSet<(u64, u64)>,
    reserved: BTreeSet<Sector>,
}

impl SectorState {
    fn insert_free(&mut self, sector: Sector) {
        self.free_by_start.insert(sector.start, sector);
        self.free_by_size.insert((sector.length(), sector.start));
    }

    fn remove_free(&mut self, sector: Sector) {
        self.free_by_start.remove(&sector.start);
        self.free_by_size.remove(&(sector.length(), sector.start));
    }

    fn trailing_free_reaches_stop(&self) -> bool {
        self.free_by_start
            .values()
            .next_back()
            .is_some_and(|last| last.stop == self.stop)
    }
}

/// Tracks which parts of an address space are free and which are reserved.
///
/// Free and reserved sectors always cover `[start, stop)` exactly, and no two
/// free sectors are adjacent.
#[derive(Debug)]
pub struct SectorManager {
    start: u64,
    resizable: bool,
    state: Mutex<SectorState>,
}

impl SectorManager {
    /// Create a manager over `[start, stop)`. A resizable region grows at its
    /// high end when no free sector fits a request.
    pub fn new(start: u64, stop: u64, resizable: bool) -> Result<Self, SectorError> {
        if stop < start {
            return Err(SectorError::InvalidRegion { start, stop });
        }
        let mut state = SectorState {
            stop,
            free_by_start: BTreeMap::new(),
            free_by_size: BTreeSet::new(),
            reserved: BTreeSet::new(),
        };
        if stop > start {
            state.insert_free(Sector::new(start, stop));
        }
        Ok(Self {
            start,
            resizable,
            state: Mutex::new(state),
        })
    }

    /// Find and reserve a sector of exactly `length` units.
    ///
    /// Picks the smallest free sector that fits, lowest start first, and
    /// carves from its low end.
    pub fn reserve_space(&self, length: u64) -> Result<Sector, SectorError> {
        if length == 0 {
            return Err(SectorError::InvalidLength);
        }
        let mut state = self.state.lock();
        let candidate = state.free_by_size.range((length, 0)..).next().copied();
        let sector = match candidate {
            Some((free_length, free_start)) => {
                state.remove_free(Sector::new(free_start, free_start + free_length));
                let sector = Sector::new(free_start, free_start + length);
                if free_length > length {
                    state.insert_free(Sector::new(sector.stop, free_start + free_length));
                }
                sector
            }
            None if self.resizable => {
                let sector = Sector::new(state.stop, state.stop + length);
                state.stop = sector.stop;
                sector
            }
            None => {
                return Err(SectorError::NoValidSector(
                    "not enough contiguous space to allocate the length",
                ));
            }
        };
        state.reserved.insert(sector);
        tracing::trace!(start = sector.start, stop = sector.stop, "reserved space");
        Ok(sector)
    }

    /// Reserve a specific sector.
    pub fn reserve(&self, sector: Sector) -> Result<(), SectorError> {
        if sector.stop <= sector.start {
            return Err(SectorError::InvalidLength);
        }
        let mut state = self.state.lock();

        if sector.start >= state.stop && !state.trailing_free_reaches_stop() {
            if !self.resizable {
                return Err(SectorError::NoValidSector(
                    "the sector starts outside of the region",
                ));
            }
            let grown = Sector::new(state.stop, sector.stop);
            state.insert_free(grown);
            state.stop = sector.stop;
        }

        let free = state
            .free_by_start
            .range(..=sector.start)
            .next_back()
            .map(|(_, free)| *free)
            .ok_or(SectorError::NoValidSector(
                "no free sector starts at or before the requested one",
            ))?;

        let container = if sector.stop <= free.stop {
            free
        } else if free.stop == state.stop {
            if !self.resizable {
                return Err(SectorError::NoValidSector(
                    "the sector is outside the region and the region is not resizable",
                ));
            }
            state.stop = sector.stop;
            Sector::new(free.start, sector.stop)
        } else {
            return Err(SectorError::NoValidSector(
                "the requested sector is not free to be reserved",
            ));
        };

        state.remove_free(free);
        for piece in container.split(&sector) {
            state.insert_free(piece);
        }
        state.reserved.insert(sector);
        tracing::trace!(start = sector.start, stop = sector.stop, "reserved sector");
        Ok(())
    }

    /// Free a reserved sector, merging it with free neighbours.
    ///
    /// The sector must exactly match one previously reserved.
    pub fn free(&self, sector: Sector) -> Result<(), SectorError> {
        let mut state = self.state.lock();
        if !state.reserved.remove(&sector) {
            return Err(SectorError::NotReserved(sector));
        }

        let mut merged = sector;
        if let Some(right) = state.free_by_start.get(&sector.stop).copied() {
            state.remove_free(right);
            merged.stop = right.stop;
        }
        let left = state
            .free_by_start
            .range(..sector.start)
            .next_back()
            .map(|(_, left)| *left)
            .filter(|left| left.stop == sector.start);
        if let Some(left) = left {
            state.remove_free(left);
            merged.start = left.start;
        }
        state.insert_free(merged);
        tracing::trace!(start = sector.start, stop = sector.stop, "freed sector");
        Ok(())
    }

    /// Reserved sectors ordered by start.
    pub fn sectors(&self) -> Vec<Sector> {
        self.state.lock().reserved.iter().copied().collect()
    }

    /// Free sectors ordered by start.
    pub fn free_sectors(&self) -> Vec<Sector> {
        self.state.lock().free_by_start.values().copied().collect()
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Current end of the managed region.
    pub fn stop(&self) -> u64 {
        self.state.lock().stop
    }

    pub fn is_resizable(&self) -> bool {
        self.resizable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const SECTOR_SIZE: u64 = 4096;

    fn s(start: u64, stop: u64) -> Sector {
        Sector::new(start * SECTOR_SIZE, stop * SECTOR_SIZE)
    }

    /// Free and reserved sectors tile the region exactly with no adjacent free pair.
    fn validate(manager: &SectorManager) {
        let state = manager.state.lock();
        let by_start: BTreeSet<(u64, u64)> = state
            .free_by_start
            .values()
            .map(|f| (f.length(), f.start))
            .collect();
        assert_eq!(by_start, state.free_by_size);

        let mut all: Vec<(Sector, bool)> = state
            .free_by_start
            .values()
            .map(|f| (*f, true))
            .chain(state.reserved.iter().map(|r| (*r, false)))
            .collect();
        all.sort_by_key(|(sector, _)| sector.start);

        let mut cursor = manager.start;
        let mut previous_free = false;
        for (sector, is_free) in all {
            assert_eq!(sector.start, cursor, "gap or overlap at {cursor}");
            assert!(sector.length() > 0);
            assert!(!(previous_free && is_free), "adjacent free sectors at {cursor}");
            cursor = sector.stop;
            previous_free = is_free;
        }
        assert_eq!(cursor, state.stop);
    }

    #[test]
    fn new_manager_has_no_sectors() {
        let manager = SectorManager::new(0, 0, true).unwrap();
        assert!(manager.sectors().is_empty());
        validate(&manager);
    }

    #[test]
    fn invalid_region_is_rejected() {
        assert_eq!(
            SectorManager::new(10, 5, true).unwrap_err(),
            SectorError::InvalidRegion { start: 10, stop: 5 }
        );
    }

    #[test]
    fn zero_length_is_rejected() {
        let manager = SectorManager::new(0, 10, true).unwrap();
        assert_eq!(manager.reserve_space(0), Err(SectorError::InvalidLength));
        assert_eq!(manager.reserve(Sector::new(3, 3)), Err(SectorError::InvalidLength));
    }

    #[test]
    fn reserve_and_free() {
        let manager = SectorManager::new(0, 0, true).unwrap();

        manager.reserve_space(SECTOR_SIZE).unwrap();
        assert_eq!(manager.sectors(), vec![s(0, 1)]);

        manager.reserve_space(SECTOR_SIZE).unwrap();
        assert_eq!(manager.sectors(), vec![s(0, 1), s(1, 2)]);

        manager.free(s(0, 1)).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2)]);

        manager.reserve_space(SECTOR_SIZE).unwrap();
        assert_eq!(manager.sectors(), vec![s(0, 1), s(1, 2)]);

        manager.reserve(s(10, 11)).unwrap();
        assert_eq!(manager.sectors(), vec![s(0, 1), s(1, 2), s(10, 11)]);

        // Larger than the gap, so the region grows.
        manager.reserve_space(10 * SECTOR_SIZE).unwrap();
        assert_eq!(
            manager.sectors(),
            vec![s(0, 1), s(1, 2), s(10, 11), s(11, 21)]
        );

        manager.reserve_space(7 * SECTOR_SIZE).unwrap();
        assert_eq!(
            manager.sectors(),
            vec![s(0, 1), s(1, 2), s(2, 9), s(10, 11), s(11, 21)]
        );

        manager.reserve_space(2 * SECTOR_SIZE).unwrap();
        assert_eq!(
            manager.sectors(),
            vec![s(0, 1), s(1, 2), s(2, 9), s(10, 11), s(11, 21), s(21, 23)]
        );

        manager.reserve_space(SECTOR_SIZE).unwrap();
        assert_eq!(
            manager.sectors(),
            vec![
                s(0, 1),
                s(1, 2),
                s(2, 9),
                s(9, 10),
                s(10, 11),
                s(11, 21),
                s(21, 23)
            ]
        );
        assert!(manager.free_sectors().is_empty());
        validate(&manager);
    }

    #[test]
    fn freed_neighbours_merge() {
        let manager = SectorManager::new(0, 0, true).unwrap();
        manager.reserve(s(1, 2)).unwrap();
        manager.reserve(s(2, 9)).unwrap();
        manager.reserve(s(9, 10)).unwrap();
        manager.reserve(s(10, 11)).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2), s(2, 9), s(9, 10), s(10, 11)]);

        manager.free(s(2, 9)).unwrap();
        manager.free(s(9, 10)).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2), s(10, 11)]);
        manager.reserve_space(8 * SECTOR_SIZE).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2), s(2, 10), s(10, 11)]);

        manager.free(s(2, 10)).unwrap();
        manager.reserve(s(2, 9)).unwrap();
        manager.reserve(s(9, 10)).unwrap();

        // Free in the opposite order and reserve the merged span directly.
        manager.free(s(9, 10)).unwrap();
        manager.free(s(2, 9)).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2), s(10, 11)]);
        manager.reserve(s(2, 10)).unwrap();
        assert_eq!(manager.sectors(), vec![s(1, 2), s(2, 10), s(10, 11)]);
        validate(&manager);
    }

    #[test]
    fn adjacent_frees_leave_one_free_sector() {
        for reverse in [false, true] {
            let manager = SectorManager::new(0, 100, false).unwrap();
            let a = manager.reserve_space(10).unwrap();
            let b = manager.reserve_space(20).unwrap();
            assert_eq!(a.stop, b.start);
            if reverse {
                manager.free(b).unwrap();
                manager.free(a).unwrap();
            } else {
                manager.free(a).unwrap();
                manager.free(b).unwrap();
            }
            assert_eq!(manager.free_sectors(), vec![Sector::new(0, 100)]);
            validate(&manager);
        }
    }

    #[test]
    fn best_fit_prefers_lowest_start() {
        let manager = SectorManager::new(0, 22, false).unwrap();
        // Leave free sectors of lengths 10, 4 and 4 in increasing start order.
        manager.reserve(Sector::new(10, 11)).unwrap();
        manager.reserve(Sector::new(15, 16)).unwrap();
        manager.reserve(Sector::new(20, 22)).unwrap();
        assert_eq!(
            manager.free_sectors(),
            vec![Sector::new(0, 10), Sector::new(11, 15), Sector::new(16, 20)]
        );

        assert_eq!(manager.reserve_space(4).unwrap(), Sector::new(11, 15));
        assert_eq!(manager.reserve_space(4).unwrap(), Sector::new(16, 20));
        assert_eq!(manager.reserve_space(4).unwrap(), Sector::new(0, 4));
        validate(&manager);
    }

    #[test]
    fn free_unreserved_is_an_error() {
        let manager = SectorManager::new(0, 0, true).unwrap();
        assert_eq!(
            manager.free(s(0, 1)),
            Err(SectorError::NotReserved(s(0, 1)))
        );

        let sector = manager.reserve_space(8).unwrap();
        assert!(manager.free(Sector::new(sector.start, sector.stop - 1)).is_err());
        manager.free(sector).unwrap();
        assert!(manager.free(sector).is_err());
    }

    #[test]
    fn reserve_over_reserved_space_fails() {
        let manager = SectorManager::new(0, 0, true).unwrap();
        manager.reserve_space(SECTOR_SIZE).unwrap();
        assert!(matches!(
            manager.reserve(s(0, 1)),
            Err(SectorError::NoValidSector(_))
        ));

        let manager = SectorManager::new(0, 100, true).unwrap();
        manager.reserve(Sector::new(5, 6)).unwrap();
        manager.reserve(Sector::new(6, 7)).unwrap();
        manager.reserve(Sector::new(8, 9)).unwrap();
        assert!(manager.reserve(Sector::new(6, 8)).is_err());
        assert!(manager.reserve(Sector::new(7, 9)).is_err());
        validate(&manager);
    }

    #[test]
    fn fixed_region_does_not_grow() {
        let manager = SectorManager::new(0, SECTOR_SIZE, false).unwrap();
        assert!(matches!(
            manager.reserve_space(2 * SECTOR_SIZE),
            Err(SectorError::NoValidSector(_))
        ));
        assert!(manager.reserve(s(1, 2)).is_err());
        assert!(manager.reserve(Sector::new(10, SECTOR_SIZE + 1)).is_err());
        assert_eq!(manager.stop(), SECTOR_SIZE);
        validate(&manager);
    }

    #[test]
    fn reserve_past_trailing_free_sector_grows() {
        let manager = SectorManager::new(0, 10, true).unwrap();
        manager.reserve(Sector::new(12, 14)).unwrap();
        assert_eq!(manager.stop(), 14);
        assert_eq!(manager.free_sectors(), vec![Sector::new(0, 12)]);

        manager.reserve(Sector::new(10, 16)).unwrap_err();
        manager.reserve(Sector::new(14, 16)).unwrap();
        assert_eq!(manager.stop(), 16);
        validate(&manager);
    }

    #[test]
    fn random_operations_keep_coverage() {
        let manager = SectorManager::new(3, 50, true).unwrap();
        let mut reserved: Vec<Sector> = Vec::new();
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for _ in 0..2000 {
            match next() % 3 {
                0 => {
                    let length = next() % 12 + 1;
                    reserved.push(manager.reserve_space(length).unwrap());
                }
                1 => {
                    let start = next() % (manager.stop() + 8);
                    let length = next() % 6 + 1;
                    let sector = Sector::new(start, start + length);
                    if manager.reserve(sector).is_ok() {
                        reserved.push(sector);
                    }
                }
                _ => {
                    if !reserved.is_empty() {
                        let index = (next() % reserved.len() as u64) as usize;
                        manager.free(reserved.swap_remove(index)).unwrap();
                    }
                }
            }
            validate(&manager);
        }

        let mut expected = reserved.clone();
        expected.sort();
        assert_eq!(manager.sectors(), expected);
    }

    #[test]
    fn concurrent_reservations_never_overlap() {
        let manager = Arc::new(SectorManager::new(0, 64, true).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    (0..100)
                        .map(|j| manager.reserve_space((i + j) % 5 + 1).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<Sector> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.sort();
        for pair in all.windows(2) {
            assert!(!pair[0].intersects(&pair[1]));
        }
        assert_eq!(all.len(), 800);
        validate(&manager);
    }

    #[test]
    fn sector_helpers() {
        let outer = Sector::new(0, 10);
        let inner = Sector::new(3, 5);
        assert!(outer.contains(&inner));
        assert!(outer.intersects(&inner));
        assert!(Sector::new(0, 3).neighbours(&inner));
        assert!(!Sector::new(0, 3).intersects(&inner));
        assert_eq!(outer.split(&inner), vec![Sector::new(0, 3), Sector::new(5, 10)]);
        assert_eq!(outer.split(&outer), Vec::<Sector>::new());
        assert_eq!(outer.length(), 10);
    }
}
