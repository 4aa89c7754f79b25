//! # Slot Table
//!
//! A table of named, versioned slots that are declared empty and filled in
//! later, possibly by another thread. Readers can block until a slot is
//! declared. All operations run under one mutex.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Slot table errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SlotError {
    /// The slot was never declared.
    #[error("no slot named '{0}'")]
    Missing(String),

    /// The slot was declared twice.
    #[error("slot '{0}' already exists")]
    AlreadyExists(String),
}

#[derive(Debug, Clone)]
struct Slot<V> {
    contents: Option<V>,
    version: u64,
}

/// Named slots with version-guarded updates.
pub struct SlotTable<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    slot_created: Condvar,
}

impl<V: Clone> SlotTable<V> {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            slot_created: Condvar::new(),
        }
    }

    /// Declare empty slots. Fails without declaring anything if any name is
    /// already present.
    pub fn create_null_slots<S: AsRef<str>>(&self, names: &[S]) -> Result<(), SlotError> {
        let names: Vec<&str> = names.iter().map(|n| n.as_ref()).collect();
        let mut slots = self.slots.lock();
        if let Some(dup) = names.iter().find(|n| slots.contains_key(**n)) {
            return Err(SlotError::AlreadyExists((*dup).to_owned()));
        }
        for name in names {
            slots.insert(
                name.to_owned(),
                Slot {
                    contents: None,
                    version: 0,
                },
            );
        }
        self.slot_created.notify_all();
        Ok(())
    }

    /// Fill a slot. Updates carrying an older version than the current
    /// contents are ignored; returns whether the update was applied.
    pub fn update(&self, name: &str, version: u64, value: V) -> Result<bool, SlotError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(name)
            .ok_or_else(|| SlotError::Missing(name.to_owned()))?;
        if slot.contents.is_some() && slot.version > version {
            return Ok(false);
        }
        slot.contents = Some(value);
        slot.version = version;
        Ok(true)
    }

    /// Whether the slot is declared.
    pub fn has_slot(&self, name: &str) -> bool {
        self.slots.lock().contains_key(name)
    }

    /// Whether the slot is declared and filled.
    pub fn has_non_null(&self, name: &str) -> bool {
        self.slots
            .lock()
            .get(name)
            .is_some_and(|s| s.contents.is_some())
    }

    /// Contents of a declared slot (`None` while empty).
    pub fn get(&self, name: &str) -> Result<Option<V>, SlotError> {
        self.slots
            .lock()
            .get(name)
            .map(|s| s.contents.clone())
            .ok_or_else(|| SlotError::Missing(name.to_owned()))
    }

    /// Block until `name` is declared.
    pub fn block_until_slot_exists(&self, name: &str) {
        let mut slots = self.slots.lock();
        while !slots.contains_key(name) {
            self.slot_created.wait(&mut slots);
        }
    }

    /// Like [`block_until_slot_exists`](Self::block_until_slot_exists) with a
    /// deadline. Returns whether the slot exists.
    pub fn block_until_slot_exists_for(&self, name: &str, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut slots = self.slots.lock();
        while !slots.contains_key(name) {
            if self.slot_created.wait_until(&mut slots, deadline).timed_out() {
                return slots.contains_key(name);
            }
        }
        true
    }

    /// Number of declared slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether no slot is declared.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for SlotTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
