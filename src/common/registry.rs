//! Capacity-bounded arena that owns every [Contact] known to a node.

use crate::common::{Contact, Id};
use crate::{Error, Result};

/// Default registry capacity.
pub const MAX_CONTACTS: usize = 256;

/// Handle to a [Contact] slot in a [ContactRegistry].
///
/// Handles carry the slot generation, so a handle kept across an eviction that recycled
/// the slot resolves to nothing instead of to the new occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContactHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone)]
struct Slot {
    generation: u32,
    contact: Contact,
    /// Whether a routing table bucket points at this slot. Only unreferenced
    /// slots can be recycled.
    in_bucket: bool,
}

#[derive(Debug, Clone)]
pub struct ContactRegistry {
    slots: Vec<Slot>,
    capacity: usize,
}

impl ContactRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.min(MAX_CONTACTS)),
            capacity,
        }
    }

    // === Getters ===

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, handle: ContactHandle) -> Option<&Contact> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &slot.contact)
    }

    pub fn get_mut(&mut self, handle: ContactHandle) -> Option<&mut Contact> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| &mut slot.contact)
    }

    /// Returns the handle of the slot holding `id`, if any.
    pub fn find(&self, id: &Id) -> Option<ContactHandle> {
        self.slots
            .iter()
            .position(|slot| slot.contact.id() == id)
            .map(|index| self.handle(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ContactHandle, &Contact)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (self.handle(index), &slot.contact))
    }

    // === Public Methods ===

    /// Return the slot already holding this contact's id, or store it in a free slot.
    ///
    /// A slot is free if it was never used or if no bucket references it anymore.
    pub fn insert(&mut self, contact: Contact) -> Result<ContactHandle> {
        if let Some(handle) = self.find(contact.id()) {
            return Ok(handle);
        }

        if self.slots.len() < self.capacity {
            self.slots.push(Slot {
                generation: 0,
                contact,
                in_bucket: false,
            });
            return Ok(self.handle(self.slots.len() - 1));
        }

        let index = self
            .slots
            .iter()
            .position(|slot| !slot.in_bucket)
            .ok_or(Error::RegistryFull)?;

        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        slot.contact = contact;

        Ok(self.handle(index))
    }

    pub(crate) fn set_in_bucket(&mut self, handle: ContactHandle, in_bucket: bool) {
        if let Some(slot) = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
        {
            slot.in_bucket = in_bucket;
        }
    }

    /// Mark every contact whose Link died as offline, returns how many changed.
    pub fn clean(&mut self) -> usize {
        let mut count = 0;

        for slot in self.slots.iter_mut() {
            let contact = &mut slot.contact;
            if contact.is_online() && contact.link().is_some() && !contact.has_live_link() {
                contact.mark_offline();
                count += 1;
            }
        }

        count
    }

    // === Private Methods ===

    fn handle(&self, index: usize) -> ContactHandle {
        ContactHandle {
            index: index as u32,
            generation: self.slots[index].generation,
        }
    }
}

impl Default for ContactRegistry {
    fn default() -> Self {
        Self::new(MAX_CONTACTS)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn insert_deduplicates_by_id() {
        let mut registry = ContactRegistry::new(4);

        let contact = Contact::random();
        let a = registry.insert(contact.clone()).unwrap();
        let b = registry.insert(contact).unwrap();

        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn full_when_every_slot_is_referenced() {
        let mut registry = ContactRegistry::new(2);

        for _ in 0..2 {
            let handle = registry.insert(Contact::random()).unwrap();
            registry.set_in_bucket(handle, true);
        }

        assert!(matches!(
            registry.insert(Contact::random()),
            Err(Error::RegistryFull)
        ));
    }

    #[test]
    fn recycled_slot_invalidates_old_handle() {
        let mut registry = ContactRegistry::new(1);

        let old = registry.insert(Contact::random()).unwrap();
        let replacement = Contact::random();
        let new = registry.insert(replacement.clone()).unwrap();

        assert_ne!(old, new);
        assert!(registry.get(old).is_none());
        assert_eq!(registry.get(new), Some(&replacement));
    }
}
