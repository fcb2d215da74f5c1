use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Generational index into a [`Pool`].
///
/// Handles are plain copyable keys. A handle whose slot has been released and
/// reused resolves to `None` instead of aliasing the new occupant.
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub fn new(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.slot, self.generation)
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new(64)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut items = Vec::with_capacity(initial_size);
        items.resize_with(initial_size, || None);
        Pool {
            items,
            // Reversed so the first insert lands in slot 0.
            empty: (0..initial_size).rev().collect(),
            generation: vec![0; initial_size],
        }
    }

    /// Stores `item`, growing the pool when every slot is taken. Returns
    /// `None` only when the 16-bit slot space is exhausted.
    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let slot = match self.empty.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.items.len();
                if slot > u16::MAX as usize {
                    return None;
                }
                self.items.push(None);
                self.generation.push(0);
                slot
            }
        };

        self.items[slot] = Some(item);
        Some(Handle::new(slot as u16, self.generation[slot]))
    }

    /// Removes the item behind `handle` and invalidates every copy of it.
    pub fn take(&mut self, handle: Handle<T>) -> Option<T> {
        let slot = handle.slot as usize;
        if self.generation.get(slot).copied() != Some(handle.generation) {
            return None;
        }
        let item = self.items[slot].take()?;
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
        Some(item)
    }

    pub fn get_ref(&self, handle: Handle<T>) -> Option<&T> {
        let slot = handle.slot as usize;
        if self.generation.get(slot).copied() == Some(handle.generation) {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, handle: Handle<T>) -> Option<&mut T> {
        let slot = handle.slot as usize;
        if self.generation.get(slot).copied() == Some(handle.generation) {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.items.iter().filter(|i| i.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live items with the handles that currently resolve to them.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> + '_ {
        self.items.iter().enumerate().filter_map(|(slot, item)| {
            item.as_ref()
                .map(|item| (Handle::new(slot as u16, self.generation[slot]), item))
        })
    }

    /// Drains every live item, invalidating all outstanding handles.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for slot in 0..self.items.len() {
            if let Some(item) = self.items[slot].take() {
                self.generation[slot] = self.generation[slot].wrapping_add(1);
                self.empty.push(slot);
                out.push(item);
            }
        }
        out
    }
}
