/// Index used to terminate a list.
pub(crate) const NIL: u32 = u32::MAX;

/// Links of one slot. Slots live in an arena (`&[Node]`) owned by the
/// caller; a [`List`] only remembers its ends, so several lists can thread
/// through the same arena as long as every slot is on at most one of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Node {
    /// Index of the next node of the list
    pub next: u32,
    /// Index of the previous node of the list
    pub prev: u32,
}

impl Node {
    pub const fn new() -> Self {
        Self { next: NIL, prev: NIL }
    }
}

/// Doubly linked list of slot indices.
///
/// All operations are O(1) except iteration. Nothing here allocates; the
/// arena is sized once by the owner.
#[derive(Debug)]
pub(crate) struct List {
    head: u32,
    tail: u32,
    len: usize,
}

#[cfg(test)]
pub(crate) struct Iter<'a> {
    nodes: &'a [Node],
    current: u32,
    remaining: usize,
}

impl List {
    pub const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn first(&self) -> Option<u32> {
        (!self.is_empty()).then_some(self.head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `index` at the tail of the list.
    ///
    /// The node at `index` must not currently be linked into any list.
    pub fn append(&mut self, nodes: &mut [Node], index: u32) {
        nodes[index as usize] = Node {
            next: NIL,
            prev: self.tail,
        };

        if self.tail == NIL {
            self.head = index;
        } else {
            nodes[self.tail as usize].next = index;
        }

        self.tail = index;
        self.len += 1;
    }

    /// Unlinks `index`, which must currently be a member of this list.
    pub fn remove(&mut self, nodes: &mut [Node], index: u32) {
        let Node { next, prev } = nodes[index as usize];

        if prev == NIL {
            self.head = next;
        } else {
            nodes[prev as usize].next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            nodes[next as usize].prev = prev;
        }

        nodes[index as usize] = Node::new();
        self.len -= 1;
    }

    /// Unlinks and returns the head of the list.
    pub fn pop_front(&mut self, nodes: &mut [Node]) -> Option<u32> {
        let head = self.first()?;
        self.remove(nodes, head);
        Some(head)
    }

    #[cfg(test)]
    pub fn iter<'a>(&self, nodes: &'a [Node]) -> Iter<'a> {
        Iter {
            nodes,
            current: self.head,
            remaining: self.len,
        }
    }
}

#[cfg(test)]
impl Iterator for Iter<'_> {
    type Item = u32;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current == NIL {
            return None;
        }

        let index = self.current;
        self.current = self.nodes[index as usize].next;
        self.remaining -= 1;

        Some(index)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}
