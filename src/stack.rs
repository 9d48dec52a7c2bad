use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::epoch::Guard;

#[derive(Debug)]
struct Cell<T: Send> {
    next: *mut Cell<T>,
    item: ManuallyDrop<T>,
}

unsafe impl<T: Send> Send for Cell<T> {}

/// A popped cell whose item has already been moved out. Other threads may
/// still be reading its `next` pointer, so it must pass through the
/// collector before its memory is released.
#[derive(Debug)]
pub(crate) struct Retired<T: Send>(Box<Cell<T>>);

/// Treiber stack. Pushing needs no protection, popping must happen inside
/// a pinned [`Guard`] because competing poppers dereference the head cell.
#[derive(Debug)]
pub(crate) struct Stack<T: Send> {
    head: AtomicPtr<Cell<T>>,
}

impl<T: Send> Default for Stack<T> {
    fn default() -> Stack<T> {
        Stack {
            head: AtomicPtr::default(),
        }
    }
}

impl<T: Send> Drop for Stack<T> {
    fn drop(&mut self) {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            let mut cell: Box<Cell<T>> = unsafe { Box::from_raw(cursor) };
            unsafe {
                ManuallyDrop::drop(&mut cell.item);
            }
            cursor = cell.next;
        }
    }
}

impl<T: Send> Stack<T> {
    pub(crate) fn push(&self, item: T) {
        let mut head = self.head.load(Ordering::Acquire);

        let cell = Box::new(Cell {
            item: ManuallyDrop::new(item),
            next: head,
        });

        let cell_ptr = Box::into_raw(cell);

        loop {
            let install_res =
                self.head
                    .compare_exchange(head, cell_ptr, Ordering::AcqRel, Ordering::Acquire);

            match install_res {
                Ok(_) => return,
                Err(actual_head) => {
                    head = actual_head;

                    unsafe {
                        (*cell_ptr).next = head;
                    }
                }
            }
        }
    }

    pub(crate) fn pop<D>(&self, guard: &Guard<'_, D>) -> Option<T>
    where
        D: Send + From<Retired<T>>,
    {
        let mut cursor = self.head.load(Ordering::Acquire);
        while !cursor.is_null() {
            // the guard keeps `cursor` allocated even if another thread pops it
            let head_next = unsafe { (*cursor).next };

            let pop_res =
                self.head
                    .compare_exchange(cursor, head_next, Ordering::AcqRel, Ordering::Acquire);

            match pop_res {
                Ok(_) => {
                    let mut cell: Box<Cell<T>> = unsafe { Box::from_raw(cursor) };
                    let ret = unsafe { ManuallyDrop::take(&mut cell.item) };
                    guard.defer(D::from(Retired(cell)));
                    return Some(ret);
                }
                Err(actual_head) => {
                    cursor = actual_head;
                }
            }
        }

        None
    }
}
