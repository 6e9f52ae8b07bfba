//! Event-time tumbling windows with a bounded-lateness watermark.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use orderflow_core::window::AggregateWindow;

use crate::{Error, Result};

/// What happened to one record offered to [`TumblingWindows::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
  Accepted { window_start: DateTime<Utc> },
  /// The record's window had already closed; it was dropped.
  Late { window_start: DateTime<Utc> },
  /// Adding the value would overflow the key's sum; it was dropped and the
  /// sum is unchanged.
  Overflow { window_start: DateTime<Utc> },
}

/// Per-key sums over epoch-aligned windows of a fixed size.
///
/// The watermark is the largest event time seen minus the allowed lateness
/// and never moves backwards. A window `[start, end)` closes once the
/// watermark reaches `end`; later records for it are rejected.
#[derive(Debug)]
pub struct TumblingWindows {
  size:      TimeDelta,
  lateness:  TimeDelta,
  watermark: Option<DateTime<Utc>>,
  /// Open windows by start, each holding per-key sums in key order.
  open:      BTreeMap<DateTime<Utc>, BTreeMap<String, i64>>,
}

fn delta(field: &str, duration: Duration) -> Result<TimeDelta> {
  TimeDelta::from_std(duration)
    .map_err(|e| Error::InvalidConfig(format!("{field} out of range: {e}")))
}

impl TumblingWindows {
  pub fn new(size: Duration, allowed_lateness: Duration) -> Result<Self> {
    let size = delta("window size", size)?;
    if size.num_milliseconds() <= 0 {
      return Err(Error::InvalidConfig("window size must be at least 1ms".into()));
    }
    Ok(Self {
      size,
      lateness: delta("allowed lateness", allowed_lateness)?,
      watermark: None,
      open: BTreeMap::new(),
    })
  }

  pub fn watermark(&self) -> Option<DateTime<Utc>> { self.watermark }

  pub fn open_windows(&self) -> usize { self.open.len() }

  /// Start of the window containing `t`.
  pub fn window_start(&self, t: DateTime<Utc>) -> DateTime<Utc> {
    let size_ms = self.size.num_milliseconds();
    let ms = t.timestamp_millis();
    let start = ms - ms.rem_euclid(size_ms);
    DateTime::from_timestamp_millis(start).unwrap_or(t)
  }

  pub fn add(&mut self, key: &str, value: i64, event_time: DateTime<Utc>) -> Admission {
    let window_start = self.window_start(event_time);
    if self.is_closed(window_start) {
      return Admission::Late { window_start };
    }

    let sum = self
      .open
      .entry(window_start)
      .or_default()
      .entry(key.to_owned())
      .or_insert(0);
    let Some(next) = sum.checked_add(value) else {
      return Admission::Overflow { window_start };
    };
    *sum = next;

    if let Some(candidate) = event_time.checked_sub_signed(self.lateness) {
      self.raise_watermark(candidate);
    }
    Admission::Accepted { window_start }
  }

  /// Move the watermark forward by processing time that passed without
  /// input. Has no effect before the first record.
  pub fn advance_by(&mut self, elapsed: Duration) {
    let Some(current) = self.watermark else { return };
    let Ok(elapsed) = TimeDelta::from_std(elapsed) else { return };
    if let Some(next) = current.checked_add_signed(elapsed) {
      self.raise_watermark(next);
    }
  }

  /// Remove and return every window the watermark has passed, oldest
  /// first.
  pub fn drain_closed(&mut self) -> Vec<AggregateWindow> {
    let mut out = Vec::new();
    while let Some((&start, _)) = self.open.first_key_value() {
      if !self.is_closed(start) {
        break;
      }
      if let Some((start, sums)) = self.open.pop_first() {
        self.emit(start, sums, &mut out);
      }
    }
    out
  }

  /// Remove and return every open window regardless of the watermark.
  pub fn drain_all(&mut self) -> Vec<AggregateWindow> {
    let mut out = Vec::new();
    for (start, sums) in std::mem::take(&mut self.open) {
      self.emit(start, sums, &mut out);
    }
    out
  }

  fn is_closed(&self, window_start: DateTime<Utc>) -> bool {
    match (self.watermark, window_start.checked_add_signed(self.size)) {
      (Some(watermark), Some(end)) => watermark >= end,
      _ => false,
    }
  }

  fn raise_watermark(&mut self, candidate: DateTime<Utc>) {
    if self.watermark.is_none_or(|current| candidate > current) {
      self.watermark = Some(candidate);
    }
  }

  fn emit(
    &self,
    window_start: DateTime<Utc>,
    sums: BTreeMap<String, i64>,
    out: &mut Vec<AggregateWindow>,
  ) {
    let window_end = window_start
      .checked_add_signed(self.size)
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    out.extend(sums.into_iter().map(|(key, sum)| AggregateWindow {
      key,
      window_start,
      window_end,
      sum,
    }));
  }
}
