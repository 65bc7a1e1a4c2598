//! The per-request `environ` map: parameter name to parameter value, both
//! raw byte strings (CGI environment values are not guaranteed UTF-8).
//!
//! Insertion order is preserved so that two different wire chunkings of the
//! same `PARAMS` stream produce observably identical environments.

use std::collections::HashMap;

/// An ordered, unique-key map from parameter name to parameter value.
#[derive(Debug, Default, Clone)]
pub struct Environ {
    order: Vec<(Vec<u8>, Vec<u8>)>,
    index: HashMap<Vec<u8>, usize>,
}

impl Environ {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `key => value`. If `key` was already present, its value is
    /// replaced in place without disturbing insertion order.
    pub fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        if let Some(&i) = self.index.get(&key) {
            self.order[i].1 = value;
        } else {
            self.index.insert(key.clone(), self.order.len());
            self.order.push((key, value));
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let &i = self.index.get(key)?;
        Some(&self.order[i].1)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterates `(name, value)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.order.iter().map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Flattens the map into `KEY=VALUE` byte strings, suitable for a CGI
    /// `exec` environment, terminated by a trailing empty entry (the null
    /// entry spec.md/SPEC_FULL.md §4.5 document, mirroring a C `execve`
    /// argument vector's `NULL` terminator).
    pub fn build_environ(&self) -> Vec<Vec<u8>> {
        let mut entries: Vec<Vec<u8>> = self
            .order
            .iter()
            .map(|(k, v)| {
                let mut entry = Vec::with_capacity(k.len() + v.len() + 1);
                entry.extend_from_slice(k);
                entry.push(b'=');
                entry.extend_from_slice(v);
                entry
            })
            .collect();
        entries.push(Vec::new());
        entries
    }
}
