//! Gap-tolerant ordered log.
//!
//! Items are numbered consecutively and can be inserted in any order, but
//! they are only handed out one by one following their number: if the item
//! right after the most recently read one has not arrived yet, reads stall.
//! The log can only move forward.

use std::collections::HashMap;

use crate::sched::types::SlotId;

#[derive(Debug)]
pub struct AsyncLog<T> {
    slots: HashMap<SlotId, T>,
    next: SlotId,
}

impl<T> AsyncLog<T> {
    pub fn new(start_from: SlotId) -> Self {
        Self {
            slots: HashMap::new(),
            next: start_from,
        }
    }

    /// Store `item` at `position`. Positions before the read cursor are
    /// late arrivals and are dropped silently; storing into an occupied
    /// position is a bug in the ordering layer and fails.
    pub fn insert(&mut self, position: SlotId, item: T) -> anyhow::Result<()> {
        if position < self.next {
            return Ok(());
        }
        if self.slots.contains_key(&position) {
            anyhow::bail!("log position {position} has already been taken");
        }
        self.slots.insert(position, item);
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        self.slots.contains_key(&self.next)
    }

    pub fn peek(&self) -> Option<&T> {
        self.slots.get(&self.next)
    }

    /// Move out the item at the read cursor and advance, or `None` if it
    /// has not arrived.
    pub fn next(&mut self) -> Option<(SlotId, T)> {
        let item = self.slots.remove(&self.next)?;
        let position = self.next;
        self.next += 1;
        Some((position, item))
    }
}

impl<T> Default for AsyncLog<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_inserts_drain_in_order() {
        let mut log = AsyncLog::new(5);
        for pos in 5..10 {
            log.insert(pos, pos * 10).unwrap();
        }
        for pos in 5..10 {
            assert!(log.has_next());
            assert_eq!(log.peek(), Some(&(pos * 10)));
            assert_eq!(log.next(), Some((pos, pos * 10)));
        }
        assert!(!log.has_next());
        assert_eq!(log.next(), None);
    }

    #[test]
    fn read_stalls_on_gap_until_filled() {
        let mut log = AsyncLog::new(0);
        log.insert(0, "a").unwrap();
        log.insert(2, "c").unwrap();
        log.insert(3, "d").unwrap();

        assert!(log.has_next());
        assert_eq!(log.next(), Some((0, "a")));
        assert!(!log.has_next());
        assert_eq!(log.next(), None);

        log.insert(1, "b").unwrap();
        assert_eq!(log.next(), Some((1, "b")));
        assert_eq!(log.next(), Some((2, "c")));
        assert_eq!(log.next(), Some((3, "d")));
    }

    #[test]
    fn late_insert_is_a_no_op() {
        let mut log = AsyncLog::new(0);
        log.insert(0, 1).unwrap();
        assert_eq!(log.next(), Some((0, 1)));
        // Position 0 is behind the cursor now.
        log.insert(0, 99).unwrap();
        assert!(!log.has_next());
    }

    #[test]
    fn duplicate_position_fails() {
        let mut log = AsyncLog::new(0);
        log.insert(4, "x").unwrap();
        assert!(log.insert(4, "y").is_err());
    }
}
