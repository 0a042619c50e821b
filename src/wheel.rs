//! Hashed timing wheel.
//!
//! A fixed ring of buckets and a cursor that moves one bucket per tick.
//! An entry due `ticks` ticks from now lives in bucket
//! `(cursor + ticks) % slots` and waits `(ticks - 1) / slots` extra sweeps
//! before it fires. Insertion is O(1); a tick only walks the bucket under the
//! cursor, so its cost depends on that bucket and not on the total number of
//! pending entries.

use std::collections::HashMap;
use std::time::Duration;

use uuid::Uuid;

use crate::error::WheelError;
use crate::models::WheelEntry;

pub struct TimingWheel {
  buckets: Vec<Vec<WheelEntry>>,
  // id -> bucket, for cancellation and the one-entry-per-id rule
  index: HashMap<Uuid, usize>,
  current_slot: usize,
  tick_interval: Duration,
}

impl TimingWheel {
  /// A zero slot count or tick interval is bumped to the smallest usable value.
  pub fn new(slot_count: usize, tick_interval: Duration) -> Self {
    let slot_count = slot_count.max(1);
    let tick_interval = if tick_interval.is_zero() { Duration::from_millis(1) } else { tick_interval };
    Self {
      buckets: (0..slot_count).map(|_| Vec::new()).collect(),
      index: HashMap::new(),
      current_slot: 0,
      tick_interval,
    }
  }

  /// Schedule `entry` to fire `delay` from the last tick.
  ///
  /// A zero delay is due on the very next tick. Delays whose sweep count
  /// does not fit in `u32` are rejected rather than truncated.
  pub fn add_task(&mut self, mut entry: WheelEntry, delay: Duration) -> Result<(), WheelError> {
    if self.index.contains_key(&entry.id) {
      return Err(WheelError::Duplicate(entry.id));
    }

    let ticks = self.ticks_for(delay);
    let slots = self.buckets.len() as u128;
    let rounds = u32::try_from((ticks - 1) / slots).map_err(|_| WheelError::DelayOutOfRange { ticks })?;
    let slot = (self.current_slot + (ticks % slots) as usize) % self.buckets.len();

    entry.rounds_remaining = rounds;
    self.index.insert(entry.id, slot);
    self.buckets[slot].push(entry);
    Ok(())
  }

  /// Advance the cursor one bucket and return every entry that is now due.
  pub fn tick(&mut self) -> Vec<WheelEntry> {
    self.current_slot = (self.current_slot + 1) % self.buckets.len();
    let bucket = &mut self.buckets[self.current_slot];

    let mut due = Vec::new();
    let mut i = 0;
    while i < bucket.len() {
      if bucket[i].rounds_remaining == 0 {
        let entry = bucket.swap_remove(i);
        self.index.remove(&entry.id);
        due.push(entry);
      } else {
        bucket[i].rounds_remaining -= 1;
        i += 1;
      }
    }
    due
  }

  pub fn remove(&mut self, id: &Uuid) -> Option<WheelEntry> {
    let slot = self.index.remove(id)?;
    let bucket = &mut self.buckets[slot];
    let position = bucket.iter().position(|e| e.id == *id)?;
    Some(bucket.swap_remove(position))
  }

  pub fn contains(&self, id: &Uuid) -> bool {
    self.index.contains_key(id)
  }

  /// Number of pending entries across all buckets.
  pub fn size(&self) -> usize {
    self.index.len()
  }

  pub fn slot_count(&self) -> usize {
    self.buckets.len()
  }

  pub fn current_slot(&self) -> usize {
    self.current_slot
  }

  pub fn tick_interval(&self) -> Duration {
    self.tick_interval
  }

  /// Longest delay `add_task` accepts.
  pub fn max_delay(&self) -> Duration {
    let ticks = self.buckets.len() as u128 * (u32::MAX as u128 + 1);
    let nanos = self.tick_interval.as_nanos().saturating_mul(ticks);
    let secs = u64::try_from(nanos / 1_000_000_000).unwrap_or(u64::MAX);
    Duration::new(secs, (nanos % 1_000_000_000) as u32)
  }

  fn ticks_for(&self, delay: Duration) -> u128 {
    let tick = self.tick_interval.as_nanos();
    delay.as_nanos().div_ceil(tick).max(1)
  }
}
