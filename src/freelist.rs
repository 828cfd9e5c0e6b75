use crate::list::{List, Node};

/// Which of the two lists a slot is currently linked into.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Idle,
    Used,
}

/// Slot bookkeeping of one [`crate::pool::SlabPool`].
///
/// Every slot index is on exactly one of two lists threaded through the
/// same arena:
///
/// ```text
///   idle:  head -> [3] -> [7] -> [1] <- tail     taken from the head
///   used:  head -> [0] -> [2] -> [4] <- tail     released to idle's tail
/// ```
///
/// so `used() + available() == capacity()` holds after every operation.
/// The owner is expected to wrap this in a lock; nothing here is shared.
#[derive(Debug)]
pub(crate) struct FreeList {
    nodes: Vec<Node>,
    states: Vec<SlotState>,
    idle: List,
    used: List,
}

impl FreeList {
    /// Creates the bookkeeping for `capacity` slots, all idle, in index order.
    pub fn new(capacity: u32) -> Self {
        let mut nodes = vec![Node::new(); capacity as usize];
        let mut idle = List::new();

        for index in 0..capacity {
            idle.append(&mut nodes, index);
        }

        Self {
            nodes,
            states: vec![SlotState::Idle; capacity as usize],
            idle,
            used: List::new(),
        }
    }

    /// Moves the oldest idle slot to the used list and returns its index.
    pub fn take(&mut self) -> Option<u32> {
        let index = self.idle.pop_front(&mut self.nodes)?;

        self.used.append(&mut self.nodes, index);
        self.states[index as usize] = SlotState::Used;

        Some(index)
    }

    /// Moves slot `index` back to the tail of the idle list.
    ///
    /// Returns `false`, leaving both lists untouched, if the slot is not
    /// currently in use (released twice, or never handed out).
    pub fn release(&mut self, index: u32) -> bool {
        match self.states.get(index as usize) {
            Some(SlotState::Used) => {}
            _ => return false,
        }

        self.used.remove(&mut self.nodes, index);
        self.idle.append(&mut self.nodes, index);
        self.states[index as usize] = SlotState::Idle;

        true
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.idle.len()
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.used.len()
    }
}
