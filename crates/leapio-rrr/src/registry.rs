use std::sync::Mutex;

use crate::error::{Result, RrrError};
use crate::service::ServiceStub;

/// Size of the service table.
pub const MAX_SERVICES: usize = 64;

pub(crate) type Slot = Mutex<Box<dyn ServiceStub>>;

/// Fixed-size table of service stubs indexed by service id.
pub struct ServiceRegistry {
    slots: Vec<Option<Slot>>,
    mask: u64,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SERVICES).map(|_| None).collect(),
            mask: 0,
        }
    }

    /// Register a stub under `id`. Each id may be registered once.
    pub fn register_server(&mut self, id: u8, stub: Box<dyn ServiceStub>) -> Result<()> {
        let index = usize::from(id);
        if index >= MAX_SERVICES {
            return Err(RrrError::ServiceOutOfRange {
                id,
                max: MAX_SERVICES - 1,
            });
        }
        if self.is_registered(id) {
            return Err(RrrError::DuplicateService(id));
        }
        self.slots[index] = Some(Mutex::new(stub));
        self.mask |= 1 << index;
        Ok(())
    }

    pub fn is_registered(&self, id: u8) -> bool {
        usize::from(id) < MAX_SERVICES && self.mask & (1 << id) != 0
    }

    /// Registration bitmask; bit `n` is set when service `n` is registered.
    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn len(&self) -> usize {
        self.mask.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.mask == 0
    }

    /// Registered ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = u8> + '_ {
        (0..MAX_SERVICES as u8).filter(|&id| self.is_registered(id))
    }

    pub(crate) fn get(&self, id: u8) -> Option<&Slot> {
        self.slots.get(usize::from(id))?.as_ref()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (u8, &Slot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| Some((id as u8, slot.as_ref()?)))
    }

    /// Empty the table, handing back the stubs in id order.
    pub(crate) fn drain(&mut self) -> Vec<(u8, Box<dyn ServiceStub>)> {
        self.mask = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(id, slot)| {
                let stub = slot.take()?;
                Some((id as u8, stub.into_inner().unwrap_or_else(|e| e.into_inner())))
            })
            .collect()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("mask", &format_args!("{:#018x}", self.mask))
            .finish()
    }
}
