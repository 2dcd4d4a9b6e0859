use std::collections::BTreeMap;
use ordered_float::OrderedFloat;

/// Holds timed entries until they are due, ordered by timestamp. Entries with the same timestamp
///  keep the order in which they were accepted.
pub struct TimedQueue<T> {
    entries: BTreeMap<(OrderedFloat<f64>, u64), T>,
    next_arrival: u64,
}

impl<T> Default for TimedQueue<T> {
    fn default() -> Self {
        TimedQueue {
            entries: Default::default(),
            next_arrival: 0,
        }
    }
}

impl<T> TimedQueue<T> {
    pub fn accept(&mut self, timestamp: f64, entry: T) {
        self.entries.insert((OrderedFloat(timestamp), self.next_arrival), entry);
        self.next_arrival += 1;
    }

    /// Removes all entries with a timestamp up to and including `clock` in order, passing each to
    ///  `handler`. Returns the number of processed entries.
    pub fn process_until(&mut self, clock: f64, mut handler: impl FnMut(f64, T)) -> usize {
        let mut num_processed = 0;
        while let Some(entry) = self.entries.first_entry() {
            let timestamp = entry.key().0.0;
            if timestamp > clock {
                break;
            }
            handler(timestamp, entry.remove());
            num_processed += 1;
        }
        num_processed
    }

    pub fn peek_timestamp(&self) -> Option<f64> {
        self.entries.keys().next().map(|(timestamp, _)| timestamp.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
