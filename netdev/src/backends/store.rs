//! Registry of completion handlers.
//!
//! Every device registers itself once and receives a [`HandlerId`] that is
//! attached to each native operation it submits. The id is generational:
//!
//! - **Slot**: position in the registry (low 16 bits)
//! - **Generation**: bumped each time the slot is reused (high 16 bits)
//!
//! so completions that arrive after a device is gone and its slot has been
//! handed to another device are rejected instead of misrouted.
//!
//! A device that goes away while the kernel still holds some of its buffers
//! leaves a *retired* entry behind: the storage is kept alive here until the
//! outstanding completions have all been returned.

use std::{
  any::Any,
  collections::VecDeque,
  io, mem,
  rc::{Rc, Weak},
};

use super::{Completion, Origin};

/// Receiver of completions for the operations it submitted.
pub(crate) trait CompletionHandler {
  fn complete(&self, completion: Completion);
}

/// A generational handler index packed into a `u32`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct HandlerId {
  generation: u16,
  slot: u16,
}

impl HandlerId {
  /// Packs generation and slot, generation in the high half.
  pub const fn as_u32(self) -> u32 {
    ((self.generation as u32) << 16) | (self.slot as u32)
  }

  pub const fn from_u32(packed: u32) -> Self {
    Self { slot: (packed & 0xFFFF) as u16, generation: (packed >> 16) as u16 }
  }

  pub const fn slot(self) -> u16 {
    self.slot
  }

  pub const fn generation(self) -> u16 {
    self.generation
  }
}

enum Entry {
  Vacant,
  /// Id handed out, handler not attached yet.
  Reserved,
  Live(Weak<dyn CompletionHandler>),
  Retired { keep_alive: Box<dyn Any>, outstanding: usize },
}

struct Slot {
  generation: u16,
  entry: Entry,
}

/// Where a completion has to go.
pub(crate) enum Route {
  Live(Rc<dyn CompletionHandler>),
  /// Belongs to a device that is gone; nothing to do.
  Absorbed,
  /// Stale or never issued id.
  Unknown,
}

pub(crate) struct Registry {
  slots: Vec<Slot>,
  free_list: VecDeque<u16>,
}

impl Registry {
  /// `u16::MAX` is never handed out, so no packed id can collide with the
  /// driver-private tokens built from all-ones.
  pub const CAPACITY: usize = u16::MAX as usize;

  pub fn new() -> Self {
    Self { slots: Vec::new(), free_list: VecDeque::new() }
  }

  /// Hands out a new id; [`Registry::attach`] must follow.
  pub fn reserve(&mut self) -> io::Result<HandlerId> {
    if let Some(slot) = self.free_list.pop_front() {
      let entry = &mut self.slots[slot as usize];
      debug_assert!(matches!(entry.entry, Entry::Vacant));
      entry.entry = Entry::Reserved;
      return Ok(HandlerId { slot, generation: entry.generation });
    }

    if self.slots.len() >= Self::CAPACITY {
      return Err(io::Error::new(
        io::ErrorKind::OutOfMemory,
        "completion handler registry is full",
      ));
    }

    let slot = self.slots.len() as u16;
    self.slots.push(Slot { generation: 0, entry: Entry::Reserved });
    Ok(HandlerId { slot, generation: 0 })
  }

  pub fn attach(&mut self, id: HandlerId, handler: Weak<dyn CompletionHandler>) {
    if let Some(slot) = self.slot_mut(id) {
      slot.entry = Entry::Live(handler);
    }
  }

  /// Frees the slot of `id`. Returns `false` for stale ids.
  pub fn remove(&mut self, id: HandlerId) -> bool {
    let Some(slot) = self.slot_mut(id) else {
      return false;
    };
    slot.entry = Entry::Vacant;
    slot.generation = slot.generation.wrapping_add(1);
    self.free_list.push_back(id.slot());
    true
  }

  /// Keeps `keep_alive` until `outstanding` completions have arrived for
  /// `id`, then frees the slot.
  pub fn retire(
    &mut self,
    id: HandlerId,
    keep_alive: Box<dyn Any>,
    outstanding: usize,
  ) {
    if outstanding == 0 {
      self.remove(id);
      return;
    }
    if let Some(slot) = self.slot_mut(id) {
      slot.entry = Entry::Retired { keep_alive, outstanding };
    }
  }

  pub fn route(&mut self, id: HandlerId, origin: Origin) -> Route {
    let Some(slot) = self.slot_mut(id) else {
      return Route::Unknown;
    };

    match &mut slot.entry {
      Entry::Vacant => Route::Unknown,
      Entry::Reserved => Route::Absorbed,
      Entry::Live(handler) => match handler.upgrade() {
        Some(handler) => Route::Live(handler),
        None => Route::Absorbed,
      },
      Entry::Retired { outstanding, .. } => {
        // cancel requests complete on their own, they hold no storage
        if origin != Origin::Cancel {
          *outstanding -= 1;
          if *outstanding == 0 {
            self.remove(id);
          }
        }
        Route::Absorbed
      }
    }
  }

  /// Completions still owed to retired entries.
  pub fn outstanding(&self) -> usize {
    self
      .slots
      .iter()
      .map(|slot| match slot.entry {
        Entry::Retired { outstanding, .. } => outstanding,
        _ => 0,
      })
      .sum()
  }

  /// Gives up on retired entries: their storage is leaked, since the kernel
  /// may still write into it. Returns how many entries were leaked.
  pub fn leak_retired(&mut self) -> usize {
    let mut leaked = 0;
    for slot in &mut self.slots {
      if let Entry::Retired { .. } = slot.entry {
        if let Entry::Retired { keep_alive, .. } =
          mem::replace(&mut slot.entry, Entry::Vacant)
        {
          mem::forget(keep_alive);
          leaked += 1;
        }
      }
    }
    leaked
  }

  fn slot_mut(&mut self, id: HandlerId) -> Option<&mut Slot> {
    self
      .slots
      .get_mut(id.slot() as usize)
      .filter(|slot| slot.generation == id.generation())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::backends::Outcome;
  use std::cell::Cell;

  #[derive(Default)]
  struct Counter(Cell<usize>);

  impl CompletionHandler for Counter {
    fn complete(&self, _completion: Completion) {
      self.0.set(self.0.get() + 1);
    }
  }

  fn live(registry: &mut Registry, handler: &Rc<Counter>) -> HandlerId {
    let id = registry.reserve().unwrap();
    let weak: Weak<dyn CompletionHandler> = Rc::downgrade(handler) as _;
    registry.attach(id, weak);
    id
  }

  #[test]
  fn packs_generation_high() {
    let id = HandlerId { generation: 3, slot: 7 };
    assert_eq!(id.as_u32(), (3 << 16) | 7);
    assert_eq!(HandlerId::from_u32(id.as_u32()), id);
  }

  #[test]
  fn routes_live_handlers() {
    let mut registry = Registry::new();
    let handler = Rc::new(Counter::default());
    let id = live(&mut registry, &handler);

    let Route::Live(target) = registry.route(id, Origin::Slot(0)) else {
      panic!("expected a live route");
    };
    target.complete(Completion {
      handler: id,
      origin: Origin::Slot(0),
      outcome: Outcome::success(1),
    });
    assert_eq!(handler.0.get(), 1);
  }

  #[test]
  fn stale_generation_is_rejected() {
    let mut registry = Registry::new();
    let handler = Rc::new(Counter::default());
    let old = live(&mut registry, &handler);
    assert!(registry.remove(old));
    assert!(!registry.remove(old));

    let new = live(&mut registry, &handler);
    assert_eq!(new.slot(), old.slot());
    assert_ne!(new.generation(), old.generation());
    assert!(matches!(registry.route(old, Origin::Slot(0)), Route::Unknown));
  }

  #[test]
  fn retired_entry_counts_down() {
    let mut registry = Registry::new();
    let handler = Rc::new(Counter::default());
    let id = live(&mut registry, &handler);

    registry.retire(id, Box::new(vec![0u8; 16]), 2);
    assert_eq!(registry.outstanding(), 2);

    assert!(matches!(registry.route(id, Origin::Cancel), Route::Absorbed));
    assert_eq!(registry.outstanding(), 2);
    assert!(matches!(registry.route(id, Origin::Slot(1)), Route::Absorbed));
    assert!(matches!(registry.route(id, Origin::Connect), Route::Absorbed));
    assert_eq!(registry.outstanding(), 0);

    // slot freed, the id is stale now
    assert!(matches!(registry.route(id, Origin::Slot(1)), Route::Unknown));
  }

  #[test]
  fn dropped_handler_is_absorbed() {
    let mut registry = Registry::new();
    let handler = Rc::new(Counter::default());
    let id = live(&mut registry, &handler);
    drop(handler);

    assert!(matches!(registry.route(id, Origin::Slot(0)), Route::Absorbed));
  }

  #[test]
  fn leaks_whatever_is_left() {
    let mut registry = Registry::new();
    let id = registry.reserve().unwrap();
    registry.retire(id, Box::new([0u8; 4]), 1);

    assert_eq!(registry.leak_retired(), 1);
    assert_eq!(registry.outstanding(), 0);
  }
}
