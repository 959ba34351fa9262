//! Rate-controlled automatic framing
//!
//! Transfers are registered with a requested repetition period. The
//! schedule uses the greatest common divisor of all periods as minor frame
//! time and places every transfer in every `k`th minor frame, where
//! `k = period / minor frame time`. The major frame covers the least common
//! multiple of all `k`.
//!
//! When that multiple exceeds the frame limit, every `k` is rounded to the
//! nearest power of two (ties round down, towards the faster rate), so the
//! major frame collapses to the largest `k`. Achieved periods are then
//! `k * minor frame time` and may differ from the request.
//!
//! Phases are assigned greedily in ascending `k` order (ties by transfer
//! id), each transfer taking the phase that minimizes the busiest minor
//! frame it touches, lowest phase first. A schedule whose busiest minor
//! frame cannot be sent within the minor frame time is rejected with
//! [`A429Error::InvalidRate`].

use std::collections::BTreeMap;
use tracing::{event, Level};

use crate::core::Speed;
use crate::error::{A429Error, Result};
use crate::transfer::TransferId;

/// Computed rate-controlled schedule
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RateSchedule {
    /// Minor frame time in milliseconds
    pub minor_frame_ms: u32,
    /// Transfers of each minor frame, in order
    pub frames: Vec<Vec<TransferId>>,
    /// Achieved period per transfer in milliseconds
    pub achieved: BTreeMap<TransferId, u32>,
}

impl RateSchedule {
    /// Major frame period in milliseconds
    pub fn period_ms(&self) -> u32 {
        self.minor_frame_ms * self.frames.len() as u32
    }
}

/// Requested periods of a channel and its cached schedule
#[derive(Debug, Clone, Default)]
pub(crate) struct RateTable {
    requests: BTreeMap<TransferId, u32>,
    schedule: Option<RateSchedule>,
    dirty: bool,
}

impl RateTable {
    pub(crate) fn add(&mut self, id: TransferId, rate_ms: u32) -> Result<()> {
        if !(1..=u32::from(u16::MAX)).contains(&rate_ms) {
            return Err(A429Error::invalid_rate(format!(
                "{}: rate {} ms out of range [1, {}]",
                id,
                rate_ms,
                u16::MAX
            )));
        }
        self.requests.insert(id, rate_ms);
        self.dirty = true;
        Ok(())
    }

    /// Drop a request; its slots leave the cached schedule at once so a
    /// running channel stops sending it before the next recomputation
    pub(crate) fn remove(&mut self, id: TransferId) -> bool {
        let removed = self.requests.remove(&id).is_some();
        if removed {
            self.dirty = true;
        }
        if let Some(schedule) = self.schedule.as_mut() {
            for frame in schedule.frames.iter_mut() {
                frame.retain(|other| *other != id);
            }
            schedule.achieved.remove(&id);
        }
        removed
    }

    pub(crate) fn contains(&self, id: TransferId) -> bool {
        self.requests.contains_key(&id)
    }

    pub(crate) fn requested(&self, id: TransferId) -> Option<u32> {
        self.requests.get(&id).copied()
    }

    /// Force recomputation, e.g. after a speed change
    pub(crate) fn invalidate(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.dirty || self.schedule.is_none()
    }

    /// Recompute if anything changed since the last computation
    pub(crate) fn refresh(&mut self, speed: Speed) -> Result<&RateSchedule> {
        if self.is_dirty() {
            let requests: Vec<(TransferId, u32)> = self.requests.iter().map(|(k, v)| (*k, *v)).collect();
            let schedule = compute_schedule(&requests, speed)?;
            self.schedule = Some(schedule);
            self.dirty = false;
        }
        self.schedule
            .as_ref()
            .ok_or_else(|| A429Error::internal("Rate schedule missing after refresh"))
    }

    pub(crate) fn schedule(&self) -> Option<&RateSchedule> {
        self.schedule.as_ref()
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

fn lcm_capped(a: u64, b: u64, cap: u64) -> Option<u64> {
    let l = a / u64::from(gcd(a as u32, b as u32)) * b;
    (l <= cap).then_some(l)
}

fn nearest_power_of_two(k: u32) -> u32 {
    let upper = k.next_power_of_two();
    let lower = if upper == k { k } else { upper / 2 };
    if k - lower <= upper - k {
        lower.max(1)
    } else {
        upper
    }
}

/// Build a schedule for `(transfer, requested period)` pairs
pub fn compute_schedule(requests: &[(TransferId, u32)], speed: Speed) -> Result<RateSchedule> {
    let max_frames = crate::limits::MAX_FRAME_ENTRIES as u64;
    if requests.is_empty() {
        return Ok(RateSchedule {
            minor_frame_ms: u32::from(crate::limits::DEFAULT_FRAME_TIME_MS),
            frames: Vec::new(),
            achieved: BTreeMap::new(),
        });
    }
    let base = requests.iter().fold(0, |acc, (_, rate)| gcd(acc, *rate));
    let mut multiples: Vec<(TransferId, u32)> = requests.iter().map(|(id, rate)| (*id, rate / base)).collect();

    let exact = multiples
        .iter()
        .try_fold(1u64, |acc, (_, k)| lcm_capped(acc, u64::from(*k), max_frames));
    let period = match exact {
        Some(period) => period,
        None => {
            for (_, k) in multiples.iter_mut() {
                *k = nearest_power_of_two(*k).min(crate::limits::MAX_FRAME_ENTRIES.next_power_of_two() as u32 / 2);
            }
            event!(Level::DEBUG, base, "rate periods rounded to powers of two");
            multiples.iter().map(|(_, k)| u64::from(*k)).max().unwrap_or(1)
        }
    };

    multiples.sort_by_key(|(id, k)| (*k, *id));
    let period = period as usize;
    let mut frames: Vec<Vec<TransferId>> = vec![Vec::new(); period];
    for (id, k) in &multiples {
        let k = *k as usize;
        let phase = (0..k)
            .min_by_key(|phase| {
                let load = (*phase..period).step_by(k).map(|f| frames[f].len()).max().unwrap_or(0);
                (load, *phase)
            })
            .unwrap_or(0);
        for frame in (phase..period).step_by(k) {
            frames[frame].push(*id);
        }
    }

    let busiest = frames.iter().map(Vec::len).max().unwrap_or(0) as u64;
    let needed_us = busiest * u64::from(speed.word_time_us());
    if needed_us > u64::from(base) * 1000 {
        event!(Level::WARN, base, busiest, needed_us, "rate schedule overloads the minor frame");
        return Err(A429Error::invalid_rate(format!(
            "{} words per {} ms minor frame exceed bus capacity at {}",
            busiest, base, speed
        )));
    }

    let achieved = multiples.iter().map(|(id, k)| (*id, k * base)).collect();
    Ok(RateSchedule {
        minor_frame_ms: base,
        frames,
        achieved,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn id(raw: u16) -> TransferId {
        TransferId::new(raw).unwrap()
    }

    #[test]
    fn test_exact_rates() -> Result<()> {
        let schedule = compute_schedule(&[(id(1), 10), (id(2), 20), (id(3), 25)], Speed::High)?;
        assert_eq!(schedule.minor_frame_ms, 5);
        assert_eq!(schedule.frames.len(), 20);
        assert_eq!(schedule.period_ms(), 100);
        assert_eq!(schedule.achieved[&id(1)], 10);
        assert_eq!(schedule.achieved[&id(2)], 20);
        assert_eq!(schedule.achieved[&id(3)], 25);
        for (rate, xfer) in [(10, id(1)), (20, id(2)), (25, id(3))] {
            let hits = schedule.frames.iter().filter(|f| f.contains(&xfer)).count();
            assert_eq!(hits as u32, 100 / rate);
        }
        Ok(())
    }

    #[test]
    fn test_phases_spread_load() -> Result<()> {
        let schedule = compute_schedule(&[(id(1), 20), (id(2), 20), (id(3), 10)], Speed::High)?;
        assert_eq!(schedule.minor_frame_ms, 10);
        assert_eq!(schedule.frames, vec![vec![id(3), id(1)], vec![id(3), id(2)]]);
        Ok(())
    }

    #[test]
    fn test_rounding_when_period_too_long() -> Result<()> {
        let schedule = compute_schedule(&[(id(1), 7), (id(2), 11), (id(3), 13), (id(4), 17)], Speed::High)?;
        assert_eq!(schedule.minor_frame_ms, 1);
        assert_eq!(schedule.achieved[&id(1)], 8);
        assert_eq!(schedule.achieved[&id(2)], 8);
        assert_eq!(schedule.achieved[&id(3)], 16);
        assert_eq!(schedule.achieved[&id(4)], 16);
        assert_eq!(schedule.frames.len(), 16);
        Ok(())
    }

    #[test]
    fn test_overload_rejected() {
        let requests: Vec<(TransferId, u32)> = (1..=2).map(|n| (id(n), 1)).collect();
        let err = compute_schedule(&requests, Speed::Low).map(|_| ()).unwrap_err();
        assert_eq!(err.code(), 35);
        assert!(compute_schedule(&requests, Speed::High).is_ok());
    }

    #[rstest]
    #[case(1, 1)]
    #[case(3, 2)]
    #[case(6, 4)]
    #[case(7, 8)]
    #[case(12, 8)]
    #[case(13, 16)]
    fn test_nearest_power_of_two(#[case] k: u32, #[case] expected: u32) {
        assert_eq!(nearest_power_of_two(k), expected);
    }

    #[test]
    fn test_table_is_lazy() -> Result<()> {
        let mut table = RateTable::default();
        table.add(id(1), 10)?;
        assert!(table.is_dirty());
        assert_eq!(table.refresh(Speed::High)?.minor_frame_ms, 10);
        assert!(!table.is_dirty());
        table.add(id(2), 25)?;
        assert!(table.is_dirty());
        assert!(table.remove(id(2)));
        assert!(!table.remove(id(2)));
        assert!(table.add(id(3), 0).is_err());
        Ok(())
    }

    #[test]
    fn test_remove_prunes_cached_schedule() -> Result<()> {
        let mut table = RateTable::default();
        table.add(id(1), 10)?;
        table.add(id(2), 10)?;
        table.refresh(Speed::High)?;
        assert!(table.remove(id(2)));
        let schedule = table.schedule().ok_or_else(|| A429Error::internal("no schedule"))?;
        assert!(schedule.frames.iter().all(|frame| !frame.contains(&id(2))));
        assert!(schedule.frames.iter().any(|frame| frame.contains(&id(1))));
        assert!(!schedule.achieved.contains_key(&id(2)));
        Ok(())
    }
}
