//! Round-robin scheduler over connected clients.

use crate::SchedulerError;

/// Circular visiting order.
///
/// `cursor` indexes the item `next` will return. New items are inserted
/// just before it, so a newcomer waits a full cycle like everyone else.
#[derive(Debug, Clone)]
pub struct RoundRobinScheduler<T> {
    items: Vec<T>,
    cursor: usize,
}

impl<T> Default for RoundRobinScheduler<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            cursor: 0,
        }
    }
}

impl<T: PartialEq + Clone> RoundRobinScheduler<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.items.contains(item)
    }

    pub fn add(&mut self, item: T) -> Result<(), SchedulerError> {
        if self.items.contains(&item) {
            return Err(SchedulerError::AlreadyScheduled);
        }
        self.items.insert(self.cursor, item);
        self.cursor = (self.cursor + 1) % self.items.len();
        Ok(())
    }

    pub fn remove(&mut self, item: &T) -> Result<(), SchedulerError> {
        if self.items.is_empty() {
            return Err(SchedulerError::Empty);
        }
        let position = self
            .items
            .iter()
            .position(|i| i == item)
            .ok_or(SchedulerError::NotScheduled)?;
        self.items.remove(position);
        if position < self.cursor {
            self.cursor -= 1;
        }
        if self.cursor >= self.items.len() {
            self.cursor = 0;
        }
        Ok(())
    }

    pub fn next(&mut self) -> Result<T, SchedulerError> {
        if self.items.is_empty() {
            return Err(SchedulerError::Empty);
        }
        let item = self.items[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.items.len();
        Ok(item)
    }

    /// One full cycle starting at the cursor, advancing it past every item.
    pub fn cycle(&mut self) -> Vec<T> {
        (0..self.items.len()).filter_map(|_| self.next().ok()).collect()
    }
}
