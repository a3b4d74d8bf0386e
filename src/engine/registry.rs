// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Ordered results accumulator handed to each step.
//!
//! Instead of a process-global list, every step receives a `&mut
//! ResultsRegistry<R>`. The worker clears it before a step and takes its
//! contents right after, so each record belongs to exactly one step. The
//! coordinator then appends each step's records to the caller's registry in
//! submission order.

/// An ordered, clearable list of domain results.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultsRegistry<R> {
    records: Vec<R>,
}

impl<R> ResultsRegistry<R> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }

    /// Record one result.
    pub fn append(&mut self, record: R) {
        self.records.push(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = R>) {
        self.records.extend(records);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Move all records out, leaving the registry empty.
    pub fn take(&mut self) -> Vec<R> {
        std::mem::take(&mut self.records)
    }

    pub fn records(&self) -> &[R] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}

impl<R> Default for ResultsRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> From<Vec<R>> for ResultsRegistry<R> {
    fn from(records: Vec<R>) -> Self {
        Self { records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_empties_the_registry() {
        let mut registry = ResultsRegistry::new();
        registry.append("a");
        registry.append("b");

        assert_eq!(registry.take(), vec!["a", "b"]);
        assert!(registry.is_empty());

        registry.append("c");
        assert_eq!(registry.records(), &["c"]);
    }
}
