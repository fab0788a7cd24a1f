use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use super::spoke::now_millis;
use super::{Characteristics, SpokeBearing};

/// Metadata stored next to each row of the sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RowInfo {
    pub length: usize,
    pub range_meters: u32,
    pub timestamp: u64, // millis since epoch of the last write, 0 = never written
}

/// A copy of one row, taken under the lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpokeRow {
    pub data: Vec<u8>,
    pub info: RowInfo,
}

struct SweepData {
    pixels: Vec<u8>, // spokes x max_spoke_len
    lengths: Vec<usize>,
    ranges: Vec<u32>,
    times: Vec<u64>,
}

///
/// The polar image of the last revolution: one row of intensities per spoke
/// angle. Every write replaces a whole row, and the same lock covers the row
/// bytes and its metadata, so readers see either the old or the new spoke.
///
/// Memory is only allocated in `new`; writes and reads just copy.
///
pub struct SweepBuffer {
    spokes: usize,
    max_spoke_len: usize,
    data: RwLock<SweepData>,
    rows_written: AtomicU64,
    rejected: AtomicU64,
}

impl SweepBuffer {
    /// An impossible size (see `Characteristics::is_valid`) gets the default
    /// size instead.
    pub fn new(spokes: usize, max_spoke_len: usize) -> Self {
        let size = Characteristics::new(spokes, max_spoke_len);
        let (spokes, max_spoke_len) = if size.is_valid() {
            (spokes, max_spoke_len)
        } else {
            let size = Characteristics::default();
            log::warn!(
                "Cannot allocate a sweep of {} spokes x {} pixels, using {}",
                spokes,
                max_spoke_len,
                size
            );
            (size.spokes_per_revolution, size.max_spoke_length)
        };

        SweepBuffer {
            spokes,
            max_spoke_len,
            data: RwLock::new(SweepData {
                pixels: vec![0; spokes * max_spoke_len],
                lengths: vec![0; spokes],
                ranges: vec![0; spokes],
                times: vec![0; spokes],
            }),
            rows_written: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn with_characteristics(c: Characteristics) -> Self {
        Self::new(c.spokes_per_revolution, c.max_spoke_length)
    }

    pub fn spokes(&self) -> usize {
        self.spokes
    }

    pub fn max_spoke_len(&self) -> usize {
        self.max_spoke_len
    }

    pub fn characteristics(&self) -> Characteristics {
        Characteristics::new(self.spokes, self.max_spoke_len)
    }

    /// Total number of accepted row writes since creation.
    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    /// Number of writes dropped because the angle was out of range.
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    // The data is plain bytes, a panic elsewhere cannot leave it in a state
    // that is worse than a partially drawn sweep.
    fn read(&self) -> RwLockReadGuard<'_, SweepData> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SweepData> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    ///
    /// Store a spoke in row `angle`. Samples beyond the row length are cut
    /// off, a shorter spoke clears the rest of the row. Angles outside the
    /// revolution are ignored: returns false and nothing is touched.
    ///
    pub fn write_spoke(&self, angle: SpokeBearing, samples: &[u8], range_meters: u32) -> bool {
        let angle = angle as usize;
        if angle >= self.spokes {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            log::trace!(
                "Spoke angle {} outside [0..{}> ignored",
                angle,
                self.spokes
            );
            return false;
        }

        let len = samples.len().min(self.max_spoke_len);
        let offset = angle * self.max_spoke_len;
        let now = now_millis();

        {
            let mut data = self.write();
            let row = &mut data.pixels[offset..offset + self.max_spoke_len];
            row[..len].copy_from_slice(&samples[..len]);
            row[len..].fill(0);

            data.lengths[angle] = len;
            data.ranges[angle] = range_meters;
            data.times[angle] = now;
        }

        self.rows_written.fetch_add(1, Ordering::Relaxed);
        true
    }

    ///
    /// Copy row `angle` into `dest`, which must hold at least `max_spoke_len`
    /// bytes. Nothing is allocated while the lock is held.
    ///
    pub fn read_row_into(&self, angle: SpokeBearing, dest: &mut [u8]) -> Option<RowInfo> {
        let angle = angle as usize;
        if angle >= self.spokes || dest.len() < self.max_spoke_len {
            return None;
        }
        let offset = angle * self.max_spoke_len;

        let data = self.read();
        dest[..self.max_spoke_len].copy_from_slice(&data.pixels[offset..offset + self.max_spoke_len]);
        Some(RowInfo {
            length: data.lengths[angle],
            range_meters: data.ranges[angle],
            timestamp: data.times[angle],
        })
    }

    pub fn read_row(&self, angle: SpokeBearing) -> Option<SpokeRow> {
        let mut row = vec![0; self.max_spoke_len];
        let info = self.read_row_into(angle, &mut row)?;
        Some(SpokeRow { data: row, info })
    }

    pub fn row_info(&self, angle: SpokeBearing) -> Option<RowInfo> {
        let angle = angle as usize;
        if angle >= self.spokes {
            return None;
        }
        let data = self.read();
        Some(RowInfo {
            length: data.lengths[angle],
            range_meters: data.ranges[angle],
            timestamp: data.times[angle],
        })
    }

    /// How long ago row `angle` was written, or None if it never was.
    pub fn row_age(&self, angle: SpokeBearing, now: u64) -> Option<Duration> {
        match self.row_info(angle) {
            Some(info) if info.timestamp > 0 => {
                Some(Duration::from_millis(now.saturating_sub(info.timestamp)))
            }
            _ => None,
        }
    }

    ///
    /// Copy the complete grid, row by row, into `dest` under a single read
    /// lock. This is the texture upload path.
    ///
    pub fn snapshot_into(&self, dest: &mut Vec<u8>) {
        dest.resize(self.spokes * self.max_spoke_len, 0);

        let data = self.read();
        dest.copy_from_slice(&data.pixels);
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let mut dest = Vec::new();
        self.snapshot_into(&mut dest);
        dest
    }

    pub fn clear(&self) {
        let mut data = self.write();
        data.pixels.fill(0);
        data.lengths.fill(0);
        data.ranges.fill(0);
        data.times.fill(0);
    }
}

impl std::fmt::Debug for SweepBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SweepBuffer {{ spokes: {}, max_spoke_len: {}, rows_written: {} }}",
            self.spokes,
            self.max_spoke_len,
            self.rows_written()
        )
    }
}
