//! Time-lane aggregation of detection events into one-second windows.
//!
//! Windows are keyed by their start second. Each open window sits behind
//! its own mutex so concurrent producers only contend on the window they
//! are writing to. Windows close against an event-time watermark
//! (`newest event - grace period`); once closed they are frozen into
//! `ClosedWindow`s and queued for readers in ascending order.

use crate::error::{AppError, LateEventError};
use crate::ingest::{DetectionEvent, LaneId};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);

pub const WINDOW_TIME_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Half-open one-second interval `[start, start + 1s)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeWindow {
    start_secs: i64,
}

impl TimeWindow {
    pub const LENGTH_SECS: i64 = 1;

    /// Window whose start is `timestamp` truncated to the second.
    pub fn containing(timestamp: PrimitiveDateTime) -> Self {
        Self {
            start_secs: timestamp.assume_utc().unix_timestamp(),
        }
    }

    pub fn from_start_secs(start_secs: i64) -> Self {
        Self { start_secs }
    }

    pub fn start_secs(&self) -> i64 {
        self.start_secs
    }

    pub fn end_secs(&self) -> i64 {
        self.start_secs + Self::LENGTH_SECS
    }

    pub fn next(&self) -> Self {
        Self::from_start_secs(self.end_secs())
    }

    pub fn start(&self) -> Option<PrimitiveDateTime> {
        let datetime = OffsetDateTime::from_unix_timestamp(self.start_secs).ok()?;
        Some(PrimitiveDateTime::new(datetime.date(), datetime.time()))
    }

    pub fn format_start(&self) -> Result<String, AppError> {
        match self.start() {
            Some(start) => Ok(start.format(WINDOW_TIME_FORMAT)?),
            None => Ok(self.start_secs.to_string()),
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.format_start() {
            Ok(formatted) => f.write_str(&formatted),
            Err(_) => write!(f, "{}", self.start_secs),
        }
    }
}

/// Distinct vehicles seen on one lane during one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowLaneBucket {
    vehicles: BTreeSet<String>,
}

impl WindowLaneBucket {
    /// Returns `false` when the vehicle was already counted in this bucket.
    pub fn insert(&mut self, vehicle_id: &str) -> bool {
        if self.vehicles.contains(vehicle_id) {
            return false;
        }
        self.vehicles.insert(vehicle_id.to_string())
    }

    pub fn vehicle_count(&self) -> u32 {
        self.vehicles.len() as u32
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &str> {
        self.vehicles.iter().map(String::as_str)
    }
}

/// A window that no longer accepts events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedWindow {
    pub window: TimeWindow,
    buckets: BTreeMap<LaneId, WindowLaneBucket>,
}

impl ClosedWindow {
    pub fn new(window: TimeWindow, buckets: BTreeMap<LaneId, WindowLaneBucket>) -> Self {
        Self { window, buckets }
    }

    /// 0 for lanes that saw nothing in this window.
    pub fn vehicle_count(&self, lane_id: LaneId) -> u32 {
        self.buckets
            .get(&lane_id)
            .map(WindowLaneBucket::vehicle_count)
            .unwrap_or(0)
    }

    pub fn bucket(&self, lane_id: LaneId) -> Option<&WindowLaneBucket> {
        self.buckets.get(&lane_id)
    }

    pub fn lanes(&self) -> impl Iterator<Item = LaneId> + '_ {
        self.buckets.keys().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Duplicate,
}

#[derive(Debug, Default)]
struct OpenWindow {
    buckets: BTreeMap<LaneId, WindowLaneBucket>,
    sealed: bool,
}

#[derive(Debug, Default)]
struct OpenWindows {
    windows: BTreeMap<TimeWindow, Arc<Mutex<OpenWindow>>>,
    /// Every window strictly before this one is closed.
    closed_through: Option<TimeWindow>,
}

impl OpenWindows {
    fn is_closed(&self, window: TimeWindow) -> bool {
        self.closed_through
            .is_some_and(|boundary| window < boundary)
    }
}

#[derive(Debug)]
pub struct Aggregator {
    grace: time::Duration,
    open: RwLock<OpenWindows>,
    newest: Mutex<Option<PrimitiveDateTime>>,
    lanes: RwLock<BTreeSet<LaneId>>,
    closed: Mutex<VecDeque<Arc<ClosedWindow>>>,
    late_events: AtomicU64,
}

impl Aggregator {
    pub fn new(grace_period: Duration) -> Self {
        let grace = time::Duration::try_from(grace_period).unwrap_or(time::Duration::MAX);
        Self {
            grace,
            open: RwLock::new(OpenWindows::default()),
            newest: Mutex::new(None),
            lanes: RwLock::new(BTreeSet::new()),
            closed: Mutex::new(VecDeque::new()),
            late_events: AtomicU64::new(0),
        }
    }

    pub fn grace_period(&self) -> time::Duration {
        self.grace
    }

    /// Count the event's vehicle in its (window, lane) bucket. Re-inserting a
    /// vehicle already counted there is a no-op.
    pub fn ingest(&self, event: &DetectionEvent) -> Result<IngestOutcome, AppError> {
        let window = TimeWindow::containing(event.timestamp);
        let slot = self.open_slot(window, event)?;

        let outcome = {
            let mut open = slot.lock().map_err(|_| AppError::StateLock)?;
            if open.sealed {
                drop(open);
                return Err(self.late(window, event));
            }
            let inserted = open
                .buckets
                .entry(event.lane_id)
                .or_default()
                .insert(&event.vehicle_id);
            // Registered before the slot unlocks so a sealed window never
            // holds a lane missing from `all_lanes`.
            self.lanes
                .write()
                .map_err(|_| AppError::StateLock)?
                .insert(event.lane_id);
            if inserted {
                IngestOutcome::Inserted
            } else {
                IngestOutcome::Duplicate
            }
        };

        {
            let mut newest = self.newest.lock().map_err(|_| AppError::StateLock)?;
            if newest.is_none_or(|current| event.timestamp > current) {
                *newest = Some(event.timestamp);
            }
        }

        Ok(outcome)
    }

    fn open_slot(
        &self,
        window: TimeWindow,
        event: &DetectionEvent,
    ) -> Result<Arc<Mutex<OpenWindow>>, AppError> {
        {
            let open = self.open.read().map_err(|_| AppError::StateLock)?;
            if open.is_closed(window) {
                drop(open);
                return Err(self.late(window, event));
            }
            if let Some(slot) = open.windows.get(&window) {
                return Ok(Arc::clone(slot));
            }
        }

        let mut open = self.open.write().map_err(|_| AppError::StateLock)?;
        if open.is_closed(window) {
            drop(open);
            return Err(self.late(window, event));
        }
        let slot = open.windows.entry(window).or_default();
        Ok(Arc::clone(slot))
    }

    fn late(&self, window: TimeWindow, event: &DetectionEvent) -> AppError {
        self.late_events.fetch_add(1, Ordering::Relaxed);
        let closed_through = self
            .open
            .read()
            .ok()
            .and_then(|open| open.closed_through)
            .unwrap_or_else(|| window.next());
        let err = LateEventError {
            lane_id: event.lane_id,
            vehicle_id: event.vehicle_id.clone(),
            window,
            closed_through,
        };
        warn!(
            lane = event.lane_id,
            window = %window,
            closed_through = %closed_through,
            "Dropping late detection event"
        );
        AppError::LateEvent(err)
    }

    /// Close every window that ends at or before the watermark. Returns the
    /// number of windows closed.
    pub fn close_expired(&self) -> Result<usize, AppError> {
        let newest = *self.newest.lock().map_err(|_| AppError::StateLock)?;
        let Some(newest) = newest else {
            return Ok(0);
        };
        let Some(watermark) = newest.checked_sub(self.grace) else {
            return Ok(0);
        };
        self.close_before(TimeWindow::containing(watermark))
    }

    /// Close every open window, e.g. at the end of a finite input.
    pub fn flush(&self) -> Result<usize, AppError> {
        let last = {
            let open = self.open.read().map_err(|_| AppError::StateLock)?;
            open.windows.keys().next_back().copied()
        };
        match last {
            Some(last) => self.close_before(last.next()),
            None => Ok(0),
        }
    }

    fn close_before(&self, boundary: TimeWindow) -> Result<usize, AppError> {
        // Held for the whole pass so concurrent closes queue in order.
        let mut closed = self.closed.lock().map_err(|_| AppError::StateLock)?;

        let expiring = {
            let mut open = self.open.write().map_err(|_| AppError::StateLock)?;
            if open.closed_through.is_some_and(|current| current >= boundary) {
                return Ok(0);
            }
            open.closed_through = Some(boundary);
            let still_open = open.windows.split_off(&boundary);
            std::mem::replace(&mut open.windows, still_open)
        };

        let count = expiring.len();
        for (window, slot) in expiring {
            let mut open = slot.lock().map_err(|_| AppError::StateLock)?;
            open.sealed = true;
            let buckets = std::mem::take(&mut open.buckets);
            debug!(window = %window, lanes = buckets.len(), "Window closed");
            closed.push_back(Arc::new(ClosedWindow::new(window, buckets)));
        }

        Ok(count)
    }

    /// Closed windows in ascending order. Each window is yielded once;
    /// pulling from the iterator removes it from the queue.
    pub fn windows(&self) -> ClosedWindows<'_> {
        ClosedWindows { aggregator: self }
    }

    /// Take every queued closed window at once, in ascending order.
    pub fn drain_closed(&self) -> Result<Vec<Arc<ClosedWindow>>, AppError> {
        let mut closed = self.closed.lock().map_err(|_| AppError::StateLock)?;
        Ok(closed.drain(..).collect())
    }

    /// Every lane that has contributed an accepted event so far.
    pub fn all_lanes(&self) -> Result<BTreeSet<LaneId>, AppError> {
        let lanes = self.lanes.read().map_err(|_| AppError::StateLock)?;
        Ok(lanes.clone())
    }

    pub fn open_window_count(&self) -> Result<usize, AppError> {
        let open = self.open.read().map_err(|_| AppError::StateLock)?;
        Ok(open.windows.len())
    }

    pub fn late_event_count(&self) -> u64 {
        self.late_events.load(Ordering::Relaxed)
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

pub struct ClosedWindows<'a> {
    aggregator: &'a Aggregator,
}

impl Iterator for ClosedWindows<'_> {
    type Item = Arc<ClosedWindow>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.aggregator.closed.lock() {
            Ok(mut closed) => closed.pop_front(),
            Err(_) => {
                error!("Closed window queue lock poisoned, stopping iteration");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn event(lane_id: LaneId, vehicle_id: &str, timestamp: PrimitiveDateTime) -> DetectionEvent {
        DetectionEvent {
            sensor_id: 1,
            lane_id,
            vehicle_id: vehicle_id.to_string(),
            timestamp,
            position_x: 0.0,
            position_y: 0.0,
        }
    }

    #[test]
    fn window_truncates_to_the_second() {
        let early = TimeWindow::containing(datetime!(2025-03-20 17:35:01.000001));
        let late = TimeWindow::containing(datetime!(2025-03-20 17:35:01.999999));
        let next = TimeWindow::containing(datetime!(2025-03-20 17:35:02.0));

        assert_eq!(early, late);
        assert_eq!(early.next(), next);
        assert_eq!(early.to_string(), "2025-03-20 17:35:01");
    }

    #[test]
    fn same_vehicle_in_same_window_is_counted_once() -> Result<(), AppError> {
        let aggregator = Aggregator::new(Duration::ZERO);
        let first = aggregator.ingest(&event(1, "car", datetime!(2025-03-20 17:35:01.1)))?;
        let second = aggregator.ingest(&event(1, "car", datetime!(2025-03-20 17:35:01.7)))?;
        aggregator.flush()?;

        let windows: Vec<_> = aggregator.windows().collect();

        assert_eq!(first, IngestOutcome::Inserted);
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].vehicle_count(1), 1);
        Ok(())
    }

    #[test]
    fn same_vehicle_on_two_lanes_counts_on_both() -> Result<(), AppError> {
        let aggregator = Aggregator::default();
        aggregator.ingest(&event(1, "car", datetime!(2025-03-20 17:35:01.1)))?;
        aggregator.ingest(&event(2, "car", datetime!(2025-03-20 17:35:01.2)))?;
        aggregator.flush()?;

        let window = aggregator.windows().next().ok_or(AppError::StateLock)?;

        assert_eq!(window.vehicle_count(1), 1);
        assert_eq!(window.vehicle_count(2), 1);
        assert_eq!(window.vehicle_count(3), 0);
        Ok(())
    }

    #[test]
    fn windows_come_out_ascending_with_gaps() -> Result<(), AppError> {
        let aggregator = Aggregator::default();
        aggregator.ingest(&event(1, "c", datetime!(2025-03-20 17:35:05.5)))?;
        aggregator.ingest(&event(1, "a", datetime!(2025-03-20 17:35:01.5)))?;
        aggregator.ingest(&event(1, "b", datetime!(2025-03-20 17:35:02.5)))?;
        aggregator.flush()?;

        let starts: Vec<_> = aggregator
            .windows()
            .map(|window| window.window.to_string())
            .collect();

        assert_eq!(
            starts,
            vec![
                "2025-03-20 17:35:01",
                "2025-03-20 17:35:02",
                "2025-03-20 17:35:05"
            ]
        );
        Ok(())
    }

    #[test]
    fn watermark_closes_only_windows_past_the_grace_period() -> Result<(), AppError> {
        let aggregator = Aggregator::new(Duration::from_secs(2));
        aggregator.ingest(&event(1, "a", datetime!(2025-03-20 17:35:01.2)))?;
        aggregator.ingest(&event(1, "b", datetime!(2025-03-20 17:35:02.2)))?;
        aggregator.ingest(&event(1, "c", datetime!(2025-03-20 17:35:04.5)))?;

        // watermark = 17:35:02.5, so only the 01 window has ended.
        let closed = aggregator.close_expired()?;

        assert_eq!(closed, 1);
        assert_eq!(aggregator.open_window_count()?, 2);
        assert_eq!(aggregator.windows().count(), 1);
        Ok(())
    }

    #[test]
    fn event_for_closed_window_is_late_and_dropped() -> Result<(), AppError> {
        let aggregator = Aggregator::new(Duration::ZERO);
        aggregator.ingest(&event(1, "a", datetime!(2025-03-20 17:35:01.2)))?;
        aggregator.ingest(&event(1, "b", datetime!(2025-03-20 17:35:03.2)))?;
        aggregator.close_expired()?;

        let result = aggregator.ingest(&event(2, "z", datetime!(2025-03-20 17:35:01.9)));

        match result {
            Err(AppError::LateEvent(err)) => {
                assert_eq!(err.lane_id, 2);
                assert_eq!(err.window.to_string(), "2025-03-20 17:35:01");
            }
            other => panic!("expected late event, got {other:?}"),
        }
        assert_eq!(aggregator.late_event_count(), 1);
        // a late event must not register its lane
        assert!(!aggregator.all_lanes()?.contains(&2));
        Ok(())
    }

    #[test]
    fn all_lanes_accumulates_across_windows() -> Result<(), AppError> {
        let aggregator = Aggregator::default();
        aggregator.ingest(&event(3, "a", datetime!(2025-03-20 17:35:01.2)))?;
        aggregator.ingest(&event(1, "b", datetime!(2025-03-20 17:35:09.2)))?;

        let lanes: Vec<_> = aggregator.all_lanes()?.into_iter().collect();

        assert_eq!(lanes, vec![1, 3]);
        Ok(())
    }

    #[test]
    fn concurrent_producers_keep_the_dedup_invariant() -> Result<(), AppError> {
        let aggregator = Arc::new(Aggregator::default());
        std::thread::scope(|scope| {
            for producer in 0..4 {
                let aggregator = Arc::clone(&aggregator);
                scope.spawn(move || {
                    for vehicle in 0..50 {
                        let id = format!("v{vehicle}");
                        let lane = (vehicle % 2) as LaneId;
                        let stamp = datetime!(2025-03-20 17:35:01.0)
                            + time::Duration::milliseconds(producer * 10);
                        let _ = aggregator.ingest(&event(lane, &id, stamp));
                    }
                });
            }
        });
        aggregator.flush()?;

        let window = aggregator.windows().next().ok_or(AppError::StateLock)?;

        assert_eq!(window.vehicle_count(0), 25);
        assert_eq!(window.vehicle_count(1), 25);
        Ok(())
    }

    #[test]
    fn drain_closed_empties_the_queue_in_order() -> Result<(), AppError> {
        let aggregator = Aggregator::new(Duration::ZERO);
        aggregator.ingest(&event(1, "b", datetime!(2025-03-20 17:35:02.5)))?;
        aggregator.ingest(&event(1, "a", datetime!(2025-03-20 17:35:01.5)))?;
        aggregator.flush()?;

        let drained = aggregator.drain_closed()?;

        let starts: Vec<_> = drained.iter().map(|w| w.window.to_string()).collect();
        assert_eq!(starts, vec!["2025-03-20 17:35:01", "2025-03-20 17:35:02"]);
        assert!(aggregator.drain_closed()?.is_empty());
        Ok(())
    }

    #[test]
    fn sealed_windows_only_hold_registered_lanes() -> Result<(), AppError> {
        let aggregator = Arc::new(Aggregator::new(Duration::ZERO));
        let mut unregistered = Vec::new();
        std::thread::scope(|scope| {
            for producer in 0..4u32 {
                let aggregator = Arc::clone(&aggregator);
                scope.spawn(move || {
                    for step in 0..40i64 {
                        let lane = producer * 100 + step as LaneId;
                        let stamp = datetime!(2025-03-20 17:35:00.0)
                            + time::Duration::milliseconds(step * 250);
                        let _ = aggregator.ingest(&event(lane, &format!("v{step}"), stamp));
                        let _ = aggregator.close_expired();
                    }
                });
            }
            for _ in 0..200 {
                let Ok(windows) = aggregator.drain_closed() else {
                    break;
                };
                let Ok(lanes) = aggregator.all_lanes() else {
                    break;
                };
                for window in &windows {
                    unregistered.extend(window.lanes().filter(|lane| !lanes.contains(lane)));
                }
                std::thread::yield_now();
            }
        });

        assert!(unregistered.is_empty(), "lanes missing: {unregistered:?}");
        Ok(())
    }
}
