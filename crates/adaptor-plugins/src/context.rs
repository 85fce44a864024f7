//! Generation-checked context table.
//!
//! A [`ContextId`] packs a slot index (low 32 bits) and a generation (high
//! bits). The table that issued an id is the only authority on what it
//! means: the forked plugin process builds its own table, so ids stay valid
//! across the process boundary. Reusing a slot bumps its generation, which
//! turns every id still referring to the old occupant stale.
//!
//! Generations stay below 2^31 so every id fits a signed 64-bit wire number.

use std::fmt;

use serde::{Deserialize, Serialize};

const SLOT_MASK: u64 = 0xFFFF_FFFF;
const MAX_GENERATION: u32 = 0x7FFF_FFFF;

/// Identifier of a plugin context, as carried in `context_id`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ContextId(u64);

impl ContextId {
    /// The "no context" id used by calls that do not target a context.
    pub const NONE: Self = Self(0);

    fn new(slot: u32, generation: u32) -> Self {
        Self((u64::from(generation) << 32) | u64::from(slot))
    }

    /// Wraps a raw wire value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Decodes an id returned as a numeric reply parameter.
    #[must_use]
    pub fn from_param(value: i64) -> Option<Self> {
        u64::try_from(value).ok().map(Self)
    }

    /// Raw wire value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Value used when the id travels as a numeric parameter.
    #[must_use]
    pub fn as_param(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    /// Returns `true` for [`ContextId::NONE`].
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    fn parts(self) -> (u32, u32) {
        let slot = u32::try_from(self.0 & SLOT_MASK).unwrap_or(u32::MAX);
        let generation = u32::try_from(self.0 >> 32).unwrap_or(u32::MAX);
        (slot, generation)
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (slot, generation) = self.parts();
        write!(f, "{slot}:{generation}")
    }
}

#[derive(Debug)]
struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot arena mapping [`ContextId`]s to context state.
#[derive(Debug)]
pub struct ContextTable<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for ContextTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ContextTable<T> {
    /// Creates an empty table.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Stores `value` and returns its id.
    ///
    /// Returns `None` only when every 32-bit slot is occupied.
    pub fn insert(&mut self, value: T) -> Option<ContextId> {
        if let Some(slot) = self.free.pop() {
            let entry = self.entries.get_mut(usize::try_from(slot).ok()?)?;
            entry.value = Some(value);
            self.len += 1;
            return Some(ContextId::new(slot, entry.generation));
        }
        let slot = u32::try_from(self.entries.len()).ok()?;
        self.entries.push(Entry {
            generation: 1,
            value: Some(value),
        });
        self.len += 1;
        Some(ContextId::new(slot, 1))
    }

    /// Looks up a live context.
    #[must_use]
    pub fn get(&self, id: ContextId) -> Option<&T> {
        self.entry(id)?.value.as_ref()
    }

    /// Looks up a live context for mutation.
    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut T> {
        self.entry_mut(id)?.value.as_mut()
    }

    /// Returns `true` when `id` refers to a live context.
    #[must_use]
    pub fn contains(&self, id: ContextId) -> bool {
        self.get(id).is_some()
    }

    /// Removes a live context, invalidating `id`.
    pub fn remove(&mut self, id: ContextId) -> Option<T> {
        let (slot, _) = id.parts();
        let entry = self.entry_mut(id)?;
        let value = entry.value.take()?;
        entry.generation = next_generation(entry.generation);
        self.free.push(slot);
        self.len -= 1;
        Some(value)
    }

    /// Removes every live context, returning them with their ids.
    pub fn drain(&mut self) -> Vec<(ContextId, T)> {
        let mut drained = Vec::with_capacity(self.len);
        for (index, entry) in self.entries.iter_mut().enumerate() {
            let Some(value) = entry.value.take() else {
                continue;
            };
            let Ok(slot) = u32::try_from(index) else {
                continue;
            };
            drained.push((ContextId::new(slot, entry.generation), value));
            entry.generation = next_generation(entry.generation);
            self.free.push(slot);
        }
        self.len = 0;
        drained
    }

    /// Number of live contexts.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when no context is live.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn entry(&self, id: ContextId) -> Option<&Entry<T>> {
        let (slot, generation) = id.parts();
        let entry = self.entries.get(usize::try_from(slot).ok()?)?;
        (entry.generation == generation).then_some(entry)
    }

    fn entry_mut(&mut self, id: ContextId) -> Option<&mut Entry<T>> {
        let (slot, generation) = id.parts();
        let entry = self.entries.get_mut(usize::try_from(slot).ok()?)?;
        (entry.generation == generation).then_some(entry)
    }
}

const fn next_generation(generation: u32) -> u32 {
    if generation >= MAX_GENERATION {
        1
    } else {
        generation + 1
    }
}
