//! Open-addressed table of stored blobs, keyed by their [Id].

use bytes::Bytes;

use crate::common::{Id, ID_SIZE};
use crate::{Error, Result};

/// Number of slots, one per value of the 16-bit home index.
pub const STORE_CAPACITY: usize = 1 << 16;

#[derive(Debug, Clone)]
struct Entry {
    id: Id,
    value: Bytes,
}

/// Append-only store: the first value written under an id wins.
#[derive(Debug)]
pub struct ContentStore {
    slots: Box<[Option<Entry>]>,
    len: usize,
}

impl ContentStore {
    pub fn new() -> Self {
        Self {
            slots: vec![None; STORE_CAPACITY].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Insert a value, returns `Ok(false)` if this id was already stored.
    pub fn insert(&mut self, id: Id, value: Bytes) -> Result<bool> {
        let mut index = home(&id);

        for _ in 0..STORE_CAPACITY {
            match &self.slots[index] {
                Some(entry) if entry.id == id => return Ok(false),
                Some(_) => index = (index + 1) % STORE_CAPACITY,
                None => {
                    self.slots[index] = Some(Entry { id, value });
                    self.len += 1;
                    return Ok(true);
                }
            }
        }

        Err(Error::StoreFull)
    }

    pub fn get(&self, id: &Id) -> Option<Bytes> {
        let mut index = home(id);

        for _ in 0..STORE_CAPACITY {
            match &self.slots[index] {
                Some(entry) if &entry.id == id => return Some(entry.value.clone()),
                Some(_) => index = (index + 1) % STORE_CAPACITY,
                None => return None,
            }
        }

        None
    }
}

impl Default for ContentStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Home slot: the last two id bytes, little-endian.
fn home(id: &Id) -> usize {
    let bytes = id.as_bytes();
    u16::from_le_bytes([bytes[ID_SIZE - 2], bytes[ID_SIZE - 1]]) as usize
}
