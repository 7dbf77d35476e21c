//! Checked growable table

use crate::diagnostics::RuntimeError;

/// Unordered table with an explicit capacity that doubles when full.
///
/// Growth is checked: a failed reservation fails the insert and leaves the
/// table unchanged.
#[derive(Debug)]
pub struct GrowableTable<T> {
    name: &'static str,
    items: Vec<T>,
    capacity: usize,
}

impl<T> GrowableTable<T> {
    pub fn with_capacity(name: &'static str, capacity: usize) -> Result<Self, RuntimeError> {
        let capacity = capacity.max(1);
        let mut items = Vec::new();
        items
            .try_reserve_exact(capacity)
            .map_err(|_| RuntimeError::CapacityExhausted {
                table: name,
                requested: capacity,
            })?;
        Ok(Self {
            name,
            items,
            capacity,
        })
    }

    /// Make sure one more insert cannot fail
    pub fn reserve_one(&mut self) -> Result<(), RuntimeError> {
        if self.items.len() < self.capacity {
            return Ok(());
        }
        let requested = self
            .capacity
            .checked_mul(2)
            .ok_or(RuntimeError::CapacityExhausted {
                table: self.name,
                requested: usize::MAX,
            })?;
        self.items
            .try_reserve_exact(requested - self.items.len())
            .map_err(|_| RuntimeError::CapacityExhausted {
                table: self.name,
                requested,
            })?;
        tracing::debug!("{} table grown to {} entries", self.name, requested);
        self.capacity = requested;
        Ok(())
    }

    pub fn push(&mut self, item: T) -> Result<usize, RuntimeError> {
        self.reserve_one()?;
        self.items.push(item);
        Ok(self.items.len() - 1)
    }

    /// Remove by moving the last entry into the hole
    pub fn swap_remove(&mut self, index: usize) -> Option<T> {
        (index < self.items.len()).then(|| self.items.swap_remove(index))
    }

    pub fn position(&self, pred: impl FnMut(&T) -> bool) -> Option<usize> {
        self.items.iter().position(pred)
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn pop(&mut self) -> Option<T> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_doubles_on_overflow() {
        let mut table = GrowableTable::with_capacity("test", 2).expect("should create");
        table.push(1).expect("push");
        table.push(2).expect("push");
        assert_eq!(table.capacity(), 2);
        table.push(3).expect("push");
        assert_eq!(table.capacity(), 4);
        assert!(table.len() <= table.capacity());
    }

    #[test]
    fn test_swap_remove_moves_last() {
        let mut table = GrowableTable::with_capacity("test", 4).expect("should create");
        for v in [10, 20, 30] {
            table.push(v).expect("push");
        }
        assert_eq!(table.swap_remove(0), Some(10));
        assert_eq!(table.get(0), Some(&30));
        assert_eq!(table.swap_remove(5), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let table: GrowableTable<u8> = GrowableTable::with_capacity("test", 0).expect("should create");
        assert_eq!(table.capacity(), 1);
        assert!(table.is_empty());
    }
}
