/// Indices of the buffers currently engaged in an operation.
///
/// Array-backed with a position table, so insert and remove are both O(1)
/// (removal swaps the last entry into the hole).
pub(crate) struct PendingSet {
  members: Vec<u16>,
  /// Position of each buffer in `members`, `NONE` when absent.
  position: Box<[u16]>,
}

const NONE: u16 = u16::MAX;

impl PendingSet {
  pub fn new(capacity: usize) -> Self {
    debug_assert!(capacity < NONE as usize);
    Self {
      members: Vec::with_capacity(capacity),
      position: vec![NONE; capacity].into_boxed_slice(),
    }
  }

  pub fn contains(&self, index: u16) -> bool {
    self.position[index as usize] != NONE
  }

  /// Returns `false` if `index` was already present.
  pub fn insert(&mut self, index: u16) -> bool {
    if self.contains(index) {
      return false;
    }
    self.position[index as usize] = self.members.len() as u16;
    self.members.push(index);
    true
  }

  /// Returns `false` if `index` was not present.
  pub fn remove(&mut self, index: u16) -> bool {
    let at = self.position[index as usize];
    if at == NONE {
      return false;
    }
    self.members.swap_remove(at as usize);
    if let Some(&moved) = self.members.get(at as usize) {
      self.position[moved as usize] = at;
    }
    self.position[index as usize] = NONE;
    true
  }

  pub fn clear(&mut self) {
    for &index in &self.members {
      self.position[index as usize] = NONE;
    }
    self.members.clear();
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = u16> + '_ {
    self.members.iter().copied()
  }
}
