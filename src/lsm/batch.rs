//! Write batches
//!
//! A batch is logged as one WAL entry and applied under one write lock, so
//! readers never observe part of it.

use crate::lsm::wal::Operation;

/// Ordered group of puts and deletes applied atomically
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
    operations: Vec<Operation>,
    approximate_size: usize,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.push(Operation::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.push(Operation::Delete { key: key.to_vec() });
    }

    fn push(&mut self, op: Operation) {
        self.approximate_size += op.approximate_size();
        self.operations.push(op);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Sum of key and value lengths
    pub fn approximate_size(&self) -> usize {
        self.approximate_size
    }

    pub fn clear(&mut self) {
        self.operations.clear();
        self.approximate_size = 0;
    }

    pub(crate) fn into_operations(self) -> Vec<Operation> {
        self.operations
    }
}
