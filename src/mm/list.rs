//! Intrusive circular doubly-linked list, stored inside the free memory it
//! tracks.
//!
//! A list head links block addresses whose first bytes are repurposed as the
//! node. Nothing here manages lifetimes: callers guarantee every pushed
//! address stays valid and unaliased while linked.

use std::ptr;

#[repr(C)]
pub struct List {
    prev: *mut List,
    next: *mut List,
}

impl List {
    /// Turn this node into an empty list (a self-cycle).
    pub fn init(&mut self) {
        self.prev = self;
        self.next = self;
    }

    /// Link the block at `raw_addr` in right after the head.
    ///
    /// # Safety
    /// `raw_addr` must point to at least `size_of::<List>()` bytes of
    /// otherwise-unused memory that outlives its membership in the list.
    pub unsafe fn push(&mut self, raw_addr: usize) {
        let raw_list = raw_addr as *mut List;
        ptr::write(
            raw_list,
            List {
                prev: self,
                next: self.next,
            },
        );
        self.next.as_mut().unwrap().prev = raw_list;
        self.next = raw_list;
    }

    /// Unlink and return the address right after the head.
    ///
    /// # Safety
    /// The list must be non-empty and well formed.
    pub unsafe fn pop(&mut self) -> usize {
        if self.is_empty() {
            panic!("list: empty pop");
        }
        let raw_addr = self.next as usize;
        self.next.as_mut().unwrap().remove();
        raw_addr
    }

    /// Unlink this node from whatever list it is on.
    ///
    /// # Safety
    /// The node must currently be linked.
    pub unsafe fn remove(&mut self) {
        (*self.prev).next = self.next;
        (*self.next).prev = self.prev;
    }

    pub fn is_empty(&self) -> bool {
        ptr::eq(self.next, self)
    }

    /// Visit every linked address, head to tail.
    ///
    /// # Safety
    /// The list must be well formed and must not change during the walk.
    pub unsafe fn for_each(&self, mut f: impl FnMut(usize)) {
        let mut node = self.next as *const List;
        while !ptr::eq(node, self) {
            f(node as usize);
            node = (*node).next;
        }
    }

    /// Number of linked nodes.
    ///
    /// # Safety
    /// Same requirements as [`List::for_each`].
    pub unsafe fn len(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }
}
