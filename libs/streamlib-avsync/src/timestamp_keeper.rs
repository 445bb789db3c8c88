// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! FIFO of the timestamps handed to a decoder and not yet presented.
//!
//! The keeper tells the output path how much media is in flight inside the
//! decoder and whether that media contains a timeline break.

use std::collections::VecDeque;

use crate::error::{AvSyncError, Result};
use crate::io::TrackKind;

pub const DEFAULT_DISCONTINUITY_THRESHOLD_US: i64 = 500_000;

/// Duration assumed per entry while the timeline is broken.
const EXPECTED_INPUT_DELTA_US: i64 = 40_000;

/// How far into the queue a presented timestamp is matched.
const REMOVAL_SCAN_DEPTH: usize = 20;

/// A presented timestamp only retires entries less than this far behind it.
const REMOVAL_MAX_LAG_US: i64 = 1_000_000;

/// Entries surviving this many pushes mean removals stopped matching.
const MAX_GENERATION_AGE: u64 = 100;

#[derive(Debug, Clone, Copy)]
struct Entry {
    timestamp_us: i64,
    generation: u64,
}

#[derive(Debug)]
pub struct TimestampKeeper {
    track: TrackKind,
    threshold_us: i64,
    generation: u64,
    entries: VecDeque<Entry>,
    discontinuity: bool,
}

impl TimestampKeeper {
    pub fn new(track: TrackKind) -> Self {
        Self::with_threshold(track, DEFAULT_DISCONTINUITY_THRESHOLD_US)
    }

    pub fn with_threshold(track: TrackKind, threshold_us: i64) -> Self {
        Self {
            track,
            threshold_us,
            generation: 0,
            entries: VecDeque::new(),
            discontinuity: false,
        }
    }

    pub fn set_discontinuity_threshold_us(&mut self, threshold_us: i64) {
        self.threshold_us = threshold_us;
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation = 0;
        self.discontinuity = false;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn has_discontinuity(&self) -> bool {
        self.discontinuity
    }

    pub fn push_timestamp(&mut self, timestamp_us: i64) {
        if !self.discontinuity {
            if let Some(last) = self.entries.back() {
                let delta_us = timestamp_us - last.timestamp_us;
                if delta_us.abs() > self.threshold_us {
                    self.discontinuity = true;
                    tracing::warn!(
                        "{} DISCONTINUITY DETECTED last:{}ms, timestamp:{}ms, delta:{}ms vs {}ms",
                        self.track,
                        last.timestamp_us / 1000,
                        timestamp_us / 1000,
                        delta_us / 1000,
                        self.threshold_us / 1000
                    );
                }
            }
        }
        self.entries.push_back(Entry {
            timestamp_us,
            generation: self.generation,
        });
        self.generation += 1;
    }

    /// Retire `timestamp_us` and every older entry presented along with it.
    ///
    /// Decoders may skip or merge frames, so a presented timestamp also retires
    /// the earlier entries within the scan window. A timestamp outside the
    /// queued range is ignored unless the timeline is already broken.
    pub fn remove_timestamp(&mut self, timestamp_us: i64) -> Result<()> {
        if !self.discontinuity && !self.entries.is_empty() && self.is_timestamp_out_of_range(timestamp_us) {
            tracing::warn!(
                "{} timestamp {} is unexpected (not in timerange): size:{} [{},{}]",
                self.track,
                timestamp_us,
                self.entries.len(),
                self.entries.front().map_or(-1, |e| e.timestamp_us),
                self.entries.back().map_or(-1, |e| e.timestamp_us)
            );
            return Ok(());
        }

        let last_index_to_remove = self
            .entries
            .iter()
            .take(REMOVAL_SCAN_DEPTH)
            .enumerate()
            .filter(|(_, entry)| {
                let delta_us = entry.timestamp_us - timestamp_us;
                delta_us <= 0 && delta_us.abs() < REMOVAL_MAX_LAG_US
            })
            .map(|(index, _)| index)
            .last();
        if let Some(index) = last_index_to_remove {
            self.entries.drain(..=index);
        }

        if self.entries.len() <= 1 {
            self.discontinuity = false;
        }
        if self.discontinuity {
            let still_broken = self
                .entries
                .iter()
                .zip(self.entries.iter().skip(1))
                .any(|(a, b)| (b.timestamp_us - a.timestamp_us).abs() >= self.threshold_us);
            if !still_broken {
                tracing::info!("no more discontinuity in {}", self.track);
            }
            self.discontinuity = still_broken;
        }

        self.check_integrity()
    }

    fn check_integrity(&self) -> Result<()> {
        let stale = self
            .entries
            .iter()
            .any(|entry| self.generation - entry.generation > MAX_GENERATION_AGE);
        if !stale {
            return Ok(());
        }

        tracing::warn!("{} timestamps size:{}", self.track, self.entries.len());
        if let Some(first) = self.entries.front() {
            for (index, entry) in self.entries.iter().enumerate() {
                tracing::warn!(
                    " {} -> gen:{}, delta:{}ms",
                    index,
                    entry.generation,
                    (entry.timestamp_us - first.timestamp_us) / 1000
                );
            }
        }
        Err(AvSyncError::InvariantViolation(format!(
            "{} timestamp list holds entries older than {} generations",
            self.track, MAX_GENERATION_AGE
        )))
    }

    pub fn size_in_us(&self) -> i64 {
        if self.discontinuity {
            return self.entries.len() as i64 * EXPECTED_INPUT_DELTA_US;
        }
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) if self.entries.len() > 1 => last.timestamp_us - first.timestamp_us,
            _ => 0,
        }
    }

    pub fn is_timestamp_out_of_range(&self, timestamp_us: i64) -> bool {
        let (Some(first), Some(last)) = (self.entries.front(), self.entries.back()) else {
            return true;
        };
        timestamp_us - first.timestamp_us < -self.threshold_us
            || timestamp_us - last.timestamp_us > self.threshold_us
    }

    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.entries.back().map(|e| e.timestamp_us)
    }

    pub fn first_timestamp_us(&self) -> Option<i64> {
        self.entries.front().map(|e| e.timestamp_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keeper() -> TimestampKeeper {
        TimestampKeeper::new(TrackKind::Video)
    }

    #[test]
    fn test_regular_cadence_is_continuous() {
        let mut k = keeper();
        for i in 0..50 {
            k.push_timestamp(i * 40_000);
        }
        assert!(!k.has_discontinuity());
        assert_eq!(k.size_in_us(), 49 * 40_000);
    }

    #[test]
    fn test_jump_sets_discontinuity() {
        let mut k = keeper();
        k.push_timestamp(0);
        k.push_timestamp(600_000);
        assert!(k.has_discontinuity());
        assert_eq!(k.size_in_us(), 2 * 40_000, "broken timeline is sized per entry");
    }

    #[test]
    fn test_backward_jump_sets_discontinuity() {
        let mut k = keeper();
        k.push_timestamp(10_000_000);
        k.push_timestamp(1_000_000);
        assert!(k.has_discontinuity());
    }

    #[test]
    fn test_remove_retires_older_batch() {
        let mut k = keeper();
        k.push_timestamp(0);
        k.push_timestamp(40_000);
        k.push_timestamp(80_000);
        k.remove_timestamp(40_000).unwrap();
        assert_eq!(k.size(), 1);
        assert_eq!(k.first_timestamp_us(), Some(80_000));
    }

    #[test]
    fn test_spurious_timestamp_is_ignored() {
        let mut k = keeper();
        k.push_timestamp(1_000_000);
        k.push_timestamp(1_040_000);
        k.remove_timestamp(9_000_000).unwrap();
        assert_eq!(k.size(), 2);
    }

    #[test]
    fn test_discontinuity_clears_once_window_is_clean() {
        let mut k = keeper();
        k.push_timestamp(0);
        k.push_timestamp(40_000);
        k.push_timestamp(5_000_000);
        k.push_timestamp(5_040_000);
        k.push_timestamp(5_080_000);
        assert!(k.has_discontinuity());

        k.remove_timestamp(40_000).unwrap();
        assert!(!k.has_discontinuity(), "only the new segment remains");
        assert_eq!(k.size_in_us(), 80_000);
    }

    #[test]
    fn test_discontinuity_clears_with_single_entry() {
        let mut k = keeper();
        k.push_timestamp(0);
        k.push_timestamp(2_000_000);
        k.remove_timestamp(0).unwrap();
        assert_eq!(k.size(), 1);
        assert!(!k.has_discontinuity());
        assert_eq!(k.size_in_us(), 0);
    }

    #[test]
    fn test_out_of_range() {
        let mut k = keeper();
        assert!(k.is_timestamp_out_of_range(0), "empty keeper has no range");
        k.push_timestamp(1_000_000);
        k.push_timestamp(1_040_000);
        assert!(!k.is_timestamp_out_of_range(600_000));
        assert!(k.is_timestamp_out_of_range(400_000));
        assert!(!k.is_timestamp_out_of_range(1_500_000));
        assert!(k.is_timestamp_out_of_range(1_600_000));
    }

    #[test]
    fn test_clear_resets_generation() {
        let mut k = keeper();
        for i in 0..80 {
            k.push_timestamp(i * 40_000);
        }
        k.clear();
        assert!(k.is_empty());
        assert_eq!(k.last_timestamp_us(), None);
        for i in 0..80 {
            k.push_timestamp(i * 40_000);
        }
        k.remove_timestamp(0).unwrap();
    }

    #[test]
    fn test_stale_entry_is_an_invariant_violation() {
        let mut k = TimestampKeeper::with_threshold(TrackKind::Video, i64::MAX);
        // A head entry that no presented timestamp can ever match.
        k.push_timestamp(-10_000_000);
        for i in 0..=101 {
            k.push_timestamp(i * 40_000);
        }
        let err = k.remove_timestamp(4_040_000).unwrap_err();
        assert!(matches!(err, AvSyncError::InvariantViolation(_)));
    }
}
