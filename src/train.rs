//! # Train Scheduler
//!
//! Outgoing messages are batched into *trains*: one byte buffer per target
//! that accumulates messages until a departure deadline. Each (service,
//! method) pair rides a train at most once ("passenger"); the departure
//! window of a train is bounded by the minimum debounce and the minimum
//! maximum-retention time over its passengers.
//!
//! ```text
//!  enqueue ──▶ [ current train ]──must_depart──▶ [ dispatched trains ]
//!                    │                                  │  (ordered by
//!                    │ dispatch timer                   │   departure)
//!                    ▼                                  ▼
//!                  flush ───────────────────────▶ send queue
//! ```
//!
//! The scheduler is a pure state machine: the owning endpoint drives it with
//! monotonic timestamps and arms its dispatch timer from
//! [`TrainScheduler::next_departure`]. Admission and the timer callback never
//! interleave because both run on the endpoint's task.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::mem;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::time::Instant;

use crate::config::MethodTiming;
use crate::{MethodId, ServiceId};

/// A batch of not-yet-transmitted messages under one departure plan.
#[derive(Debug)]
struct Train {
    buffer: BytesMut,
    passengers: HashSet<(ServiceId, MethodId)>,
    departure: Instant,
    minimal_debounce: Duration,
    minimal_max_retention: Duration,
}

impl Train {
    fn new(departure: Instant) -> Self {
        Self {
            buffer: BytesMut::new(),
            passengers: HashSet::new(),
            departure,
            minimal_debounce: Duration::MAX,
            minimal_max_retention: Duration::MAX,
        }
    }
}

/// Per-target train scheduler.
///
/// Dispatched trains are indexed by departure time; the next train to fly is
/// always the minimum key. Handlers hold on to departure keys, never to
/// trains, so a dispatched train is owned by exactly one place at a time.
#[derive(Debug)]
pub struct TrainScheduler {
    max_message_size: usize,
    current: Train,
    dispatched: BTreeMap<Instant, VecDeque<Train>>,
    last_departure: Option<Instant>,
}

impl TrainScheduler {
    pub fn new(max_message_size: usize, now: Instant) -> Self {
        Self {
            max_message_size,
            current: Train::new(now),
            dispatched: BTreeMap::new(),
            last_departure: None,
        }
    }

    /// Admit a message into the current train.
    ///
    /// The caller has already verified the queue byte budget and that the
    /// message fits `max_message_size`. After this returns, the caller
    /// re-arms its dispatch timer from [`Self::next_departure`].
    pub fn enqueue(
        &mut self,
        data: &[u8],
        service: ServiceId,
        method: MethodId,
        timing: MethodTiming,
        now: Instant,
    ) {
        let identifier = (service, method);
        let mut must_depart = false;

        if self.current.passengers.is_empty() {
            // latest possible departure
            self.current.departure = now + timing.max_retention;
        } else if self.current.passengers.contains(&identifier) {
            must_depart = true;
        } else if self.current.buffer.len() + data.len() > self.max_message_size {
            must_depart = true;
        } else if timing.debounce > self.current.minimal_max_retention {
            // latest departure already undershoots the new passenger's debounce
            must_depart = true;
        } else if now + timing.debounce > self.current.departure {
            // train departs earlier than the new passenger's debounce allows
            must_depart = true;
        } else if timing.max_retention < self.current.minimal_debounce {
            // earliest departure already exceeds the new passenger's retention
            must_depart = true;
        } else if now + timing.max_retention < self.current.departure {
            self.current.departure = now + timing.max_retention;
        }

        if must_depart {
            self.schedule_current(now, now + timing.max_retention);
        }

        self.current.buffer.put_slice(data);
        self.current.passengers.insert(identifier);
        if timing.debounce < self.current.minimal_debounce {
            self.current.minimal_debounce = timing.debounce;
        }
        if timing.max_retention < self.current.minimal_max_retention {
            self.current.minimal_max_retention = timing.max_retention;
        }
    }

    /// Close the current train ahead of a segment batch.
    ///
    /// Segments bypass retention (they are sent immediately), but the
    /// debounce constraints of the segmented method still apply to the
    /// trains around them.
    pub fn prepare_segments(&mut self, timing: MethodTiming, now: Instant) {
        if timing.debounce < self.current.minimal_debounce {
            self.current.minimal_debounce = timing.debounce;
        }
        if timing.max_retention < self.current.minimal_max_retention {
            self.current.minimal_max_retention = timing.max_retention;
        }
        if !self.current.passengers.is_empty() {
            self.schedule_current(now, now + timing.max_retention);
        }
    }

    /// Move the current train into the dispatched index. A full train
    /// departs at its earliest admissible time: right away, unless the
    /// elapsed time since the previous transmission would undershoot the
    /// train's minimal debounce.
    fn schedule_current(&mut self, now: Instant, next_departure: Instant) {
        debug_assert!(!self.current.passengers.is_empty());
        let mut departure = now;
        if let Some(last) = self.last_departure {
            let earliest = last + self.current.minimal_debounce;
            if earliest > departure {
                departure = earliest;
            }
        }
        self.current.departure = departure;
        let train = mem::replace(&mut self.current, Train::new(next_departure));
        self.dispatched
            .entry(train.departure)
            .or_default()
            .push_back(train);
    }

    /// Timer callback: take the next due train's buffer, if any.
    ///
    /// Returns `None` when nothing is due yet; the caller re-arms its timer
    /// from [`Self::next_departure`] afterwards in either case.
    pub fn flush(&mut self, now: Instant) -> Option<Bytes> {
        let take_dispatched = match self.dispatched.keys().next() {
            Some(key) => self.current.passengers.is_empty() || *key <= self.current.departure,
            None => false,
        };

        if take_dispatched {
            let mut entry = self.dispatched.first_entry()?;
            let departure = *entry.key();
            if departure > now {
                return None;
            }
            let train = entry.get_mut().pop_front()?;
            if entry.get().is_empty() {
                entry.remove();
            }
            return Some(train.buffer.freeze());
        }

        if self.current.passengers.is_empty() {
            return None;
        }

        // Departing the current train must still respect the debounce
        // against the previous transmission.
        if let Some(last) = self.last_departure {
            let earliest = last + self.current.minimal_debounce;
            if earliest > now {
                if earliest > self.current.departure {
                    self.current.departure = earliest;
                }
                return None;
            }
        }
        if self.current.departure > now {
            return None;
        }

        let train = mem::replace(&mut self.current, Train::new(now));
        Some(train.buffer.freeze())
    }

    /// Earliest departure among the current and dispatched trains.
    pub fn next_departure(&self) -> Option<Instant> {
        let dispatched = self.dispatched.keys().next().copied();
        let current = (!self.current.passengers.is_empty()).then_some(self.current.departure);
        match (dispatched, current) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Record a completed transmission; subsequent departures are spaced
    /// against this point.
    pub fn record_departure(&mut self, now: Instant) {
        self.last_departure = Some(now);
    }

    /// Whether no train holds data.
    pub fn is_empty(&self) -> bool {
        self.current.passengers.is_empty() && self.dispatched.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1400;

    fn timing(debounce_ms: u64, retention_ms: u64) -> MethodTiming {
        MethodTiming {
            debounce: Duration::from_millis(debounce_ms),
            max_retention: Duration::from_millis(retention_ms),
        }
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn distinct_passengers_share_a_train() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        scheduler.enqueue(&[1u8; 100], 0x1234, 0x0001, timing(50, 200), start);
        scheduler.enqueue(
            &[2u8; 100],
            0x1234,
            0x0002,
            timing(50, 200),
            start + Duration::from_millis(10),
        );

        // one train, departing at the earliest retention bound
        let departure = scheduler.next_departure().unwrap();
        assert_eq!(departure, start + Duration::from_millis(200));

        assert!(scheduler.flush(start + Duration::from_millis(100)).is_none());
        let buffer = scheduler.flush(departure).expect("train departs");
        assert_eq!(buffer.len(), 200);
        // submission order preserved
        assert_eq!(buffer[0], 1);
        assert_eq!(buffer[100], 2);
        assert!(scheduler.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn repeat_passenger_forces_departure() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        scheduler.enqueue(&[1u8; 100], 0x1234, 0x0001, timing(0, 200), start);
        let second = start + Duration::from_millis(5);
        scheduler.enqueue(&[2u8; 100], 0x1234, 0x0001, timing(0, 200), second);

        // the first train departs immediately on the second submission, the
        // second message rides the next train
        assert_eq!(scheduler.next_departure().unwrap(), second);
        let first = scheduler.flush(second).expect("first train departs");
        assert_eq!(first[0], 1);
        scheduler.record_departure(second);

        let next = scheduler.next_departure().unwrap();
        assert_eq!(next, second + Duration::from_millis(200));
        let second_train = scheduler.flush(next).expect("second train departs");
        assert_eq!(second_train[0], 2);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn oversized_train_departs() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(1400, start);

        scheduler.enqueue(&[1u8; 1000], 0x1234, 0x0001, timing(0, 200), start);
        scheduler.enqueue(&[2u8; 1000], 0x1234, 0x0002, timing(0, 200), start);

        // second message does not fit; first train goes to dispatch
        let first = scheduler.flush(start + Duration::from_millis(200)).unwrap();
        assert_eq!(first.len(), 1000);
        let second = scheduler
            .flush(start + Duration::from_millis(200))
            .expect("second train also due");
        assert_eq!(second.len(), 1000);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn smaller_retention_advances_departure() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        scheduler.enqueue(&[0u8; 10], 0x1234, 0x0001, timing(0, 500), start);
        scheduler.enqueue(&[0u8; 10], 0x1234, 0x0002, timing(0, 100), start);

        assert_eq!(
            scheduler.next_departure().unwrap(),
            start + Duration::from_millis(100)
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn incompatible_debounce_splits_train() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        // retention 100ms, then a passenger whose debounce exceeds it
        scheduler.enqueue(&[0u8; 10], 0x1234, 0x0001, timing(0, 100), start);
        scheduler.enqueue(&[0u8; 10], 0x1234, 0x0002, timing(200, 400), start);

        // two trains now exist
        assert!(scheduler.flush(start + Duration::from_millis(100)).is_some());
        assert!(!scheduler.is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn debounce_respected_between_trains() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        scheduler.enqueue(&[1u8; 10], 0x1234, 0x0001, timing(50, 60), start);
        let first_departure = scheduler.next_departure().unwrap();
        assert!(scheduler.flush(first_departure).is_some());
        scheduler.record_departure(first_departure);

        // same passenger again right away; its train may not fly before
        // last_departure + debounce
        scheduler.enqueue(
            &[2u8; 10],
            0x1234,
            0x0001,
            timing(50, 0),
            first_departure,
        );
        assert!(scheduler.flush(first_departure).is_none());
        let next = scheduler.next_departure().unwrap();
        assert!(next >= first_departure + Duration::from_millis(50));
        assert!(scheduler.flush(next).is_some());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn segments_close_the_current_train() {
        let start = Instant::now();
        let mut scheduler = TrainScheduler::new(MAX, start);

        scheduler.enqueue(&[1u8; 10], 0x1234, 0x0001, timing(0, 200), start);
        scheduler.prepare_segments(timing(0, 200), start);

        // the occupied train was scheduled for dispatch
        let buffer = scheduler.flush(start + Duration::from_millis(200)).unwrap();
        assert_eq!(buffer.len(), 10);
        assert!(scheduler.is_empty());
    }
}
