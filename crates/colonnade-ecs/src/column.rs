//! Type-erased column storage.
//!
//! A [`Column`] holds one component's values for every row of an archetype.
//! Types without drop glue live in a [`RawColumn`]: a raw aligned allocation
//! whose rows are moved by byte copy. Types with drop glue live in a
//! [`ManagedVec<T>`] behind the [`ManagedColumn`] trait object, so their
//! destructors run and their rows are moved with `mem::take`.
//!
//! Every row below `capacity` always holds a valid value: new rows are filled
//! with the component's default. Bounds are the caller's responsibility and
//! are only checked with debug assertions.

use std::alloc::{self, Layout};
use std::any::Any;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr::{self, NonNull};

// ---------------------------------------------------------------------------
// RawColumn
// ---------------------------------------------------------------------------

/// Raw storage for an unmanaged component type.
pub(crate) struct RawColumn {
    /// `None` while nothing is allocated (zero capacity or zero-sized type).
    data: Option<NonNull<u8>>,
    capacity: usize,
    elem_size: usize,
    align: usize,
    /// Bytes of the type's default value, `elem_size` long.
    template: &'static [MaybeUninit<u8>],
}

// SAFETY: the column exclusively owns its allocation and only ever stores
// `Send + Sync` component values.
unsafe impl Send for RawColumn {}
unsafe impl Sync for RawColumn {}

impl RawColumn {
    fn new(
        capacity: usize,
        elem_size: usize,
        align: usize,
        template: &'static [MaybeUninit<u8>],
    ) -> Self {
        debug_assert_eq!(template.len(), elem_size);
        let mut col = Self {
            data: None,
            capacity: 0,
            elem_size,
            align,
            template,
        };
        col.grow_to(capacity);
        col
    }

    fn layout(&self, capacity: usize) -> Layout {
        Layout::from_size_align(self.elem_size * capacity, self.align)
            .unwrap_or_else(|_| panic!("column layout overflow at capacity {capacity}"))
    }

    #[inline]
    fn row_ptr(&self, row: usize) -> *mut u8 {
        debug_assert!(row < self.capacity, "row {row} out of bounds");
        match self.data {
            // SAFETY: `row < capacity` so the offset stays inside the allocation.
            Some(p) => unsafe { p.as_ptr().add(row * self.elem_size) },
            None => NonNull::dangling().as_ptr(),
        }
    }

    fn reset(&mut self, row: usize) {
        if self.elem_size == 0 {
            return;
        }
        // SAFETY: the template is exactly one element long and the row pointer
        // addresses one element inside the allocation.
        unsafe {
            ptr::copy_nonoverlapping(
                self.template.as_ptr() as *const u8,
                self.row_ptr(row),
                self.elem_size,
            );
        }
    }

    fn grow_to(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        let old = self.capacity;
        if self.elem_size == 0 {
            self.capacity = capacity;
            return;
        }
        let new_layout = self.layout(capacity);
        // SAFETY: `new_layout` has non-zero size; the old pointer (if any) was
        // allocated with `self.layout(old)`.
        let raw = unsafe {
            match self.data {
                Some(p) => alloc::realloc(p.as_ptr(), self.layout(old), new_layout.size()),
                None => alloc::alloc(new_layout),
            }
        };
        let Some(data) = NonNull::new(raw) else {
            alloc::handle_alloc_error(new_layout);
        };
        self.data = Some(data);
        self.capacity = capacity;
        for row in old..capacity {
            self.reset(row);
        }
    }

    fn ptr<T>(&self) -> *mut T {
        match self.data {
            Some(p) => p.as_ptr().cast(),
            None => NonNull::<T>::dangling().as_ptr(),
        }
    }
}

impl Drop for RawColumn {
    fn drop(&mut self) {
        if let Some(p) = self.data.take() {
            // SAFETY: allocated with this exact layout in `grow_to`.
            unsafe { alloc::dealloc(p.as_ptr(), self.layout(self.capacity)) };
        }
    }
}

// ---------------------------------------------------------------------------
// ManagedColumn
// ---------------------------------------------------------------------------

/// Typed storage behind a managed column.
pub(crate) trait ManagedColumn: Send + Sync {
    fn capacity(&self) -> usize;
    fn grow_to(&mut self, capacity: usize);
    /// Take the value at `row` into `dest[dest_row]`, leaving a default behind.
    fn move_row(&mut self, row: usize, dest: &mut dyn ManagedColumn, dest_row: usize);
    fn fill_hole(&mut self, hole: usize, last: usize);
    fn reset(&mut self, row: usize);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Vector of interior-mutable cells so scans can write through `&Column`.
pub(crate) struct ManagedVec<T>(Vec<UnsafeCell<T>>);

// SAFETY: cells are only written under exclusive column access, which the
// archetype's access negotiation grants to one holder at a time.
unsafe impl<T: Send + Sync> Sync for ManagedVec<T> {}

impl<T: Default> ManagedVec<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let mut v = Vec::with_capacity(capacity);
        v.resize_with(capacity, || UnsafeCell::new(T::default()));
        Self(v)
    }
}

impl<T: Default + Send + Sync + 'static> ManagedColumn for ManagedVec<T> {
    fn capacity(&self) -> usize {
        self.0.len()
    }

    fn grow_to(&mut self, capacity: usize) {
        if capacity > self.0.len() {
            self.0.resize_with(capacity, || UnsafeCell::new(T::default()));
        }
    }

    fn move_row(&mut self, row: usize, dest: &mut dyn ManagedColumn, dest_row: usize) {
        let dest = dest
            .as_any_mut()
            .downcast_mut::<ManagedVec<T>>()
            .expect("managed column type mismatch");
        let value = std::mem::take(self.0[row].get_mut());
        *dest.0[dest_row].get_mut() = value;
    }

    fn fill_hole(&mut self, hole: usize, last: usize) {
        if hole != last {
            self.0.swap(hole, last);
        }
        self.reset(last);
    }

    fn reset(&mut self, row: usize) {
        *self.0[row].get_mut() = T::default();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Column
// ---------------------------------------------------------------------------

/// One component's values across all rows of an archetype.
pub(crate) enum Column {
    Unmanaged(RawColumn),
    Managed(Box<dyn ManagedColumn>),
}

impl Column {
    /// Raw column with `count` default-initialised rows.
    pub(crate) fn new_unmanaged(
        count: usize,
        elem_size: usize,
        align: usize,
        template: &'static [MaybeUninit<u8>],
    ) -> Self {
        Column::Unmanaged(RawColumn::new(count, elem_size, align, template))
    }

    /// Typed column with `count` default-initialised rows.
    #[cfg(test)]
    pub(crate) fn new_managed<T: Default + Send + Sync + 'static>(count: usize) -> Self {
        Column::Managed(Box::new(ManagedVec::<T>::with_capacity(count)))
    }

    pub(crate) fn capacity(&self) -> usize {
        match self {
            Column::Unmanaged(raw) => raw.capacity,
            Column::Managed(m) => m.capacity(),
        }
    }

    /// Grow to `capacity` rows, preserving existing rows.
    pub(crate) fn grow_to(&mut self, capacity: usize) {
        match self {
            Column::Unmanaged(raw) => raw.grow_to(capacity),
            Column::Managed(m) => m.grow_to(capacity),
        }
    }

    /// Pointer to row 0 viewed as `T`.
    ///
    /// The pointer is valid for `capacity()` rows until the next `grow_to`.
    /// Writing through it requires exclusive access to the column.
    pub(crate) fn data_ptr<T: 'static>(&self) -> *mut T {
        match self {
            Column::Unmanaged(raw) => {
                debug_assert_eq!(std::mem::size_of::<T>(), raw.elem_size);
                raw.ptr::<T>()
            }
            Column::Managed(m) => {
                let cells = &m
                    .as_any()
                    .downcast_ref::<ManagedVec<T>>()
                    .expect("managed column type mismatch")
                    .0;
                UnsafeCell::raw_get(cells.as_ptr())
            }
        }
    }

    pub(crate) fn get<T: 'static>(&self, row: usize) -> &T {
        debug_assert!(row < self.capacity());
        // SAFETY: every row below capacity holds a valid `T`.
        unsafe { &*self.data_ptr::<T>().add(row) }
    }

    pub(crate) fn get_mut<T: 'static>(&mut self, row: usize) -> &mut T {
        debug_assert!(row < self.capacity());
        // SAFETY: as in `get`, and `&mut self` guarantees exclusivity.
        unsafe { &mut *self.data_ptr::<T>().add(row) }
    }

    pub(crate) fn set<T: 'static>(&mut self, row: usize, value: T) {
        *self.get_mut::<T>(row) = value;
    }

    /// Move row `row` into `dest[dest_row]`. Both columns must hold the same
    /// type. Raw rows are byte-copied; managed rows are taken.
    pub(crate) fn copy_row(&mut self, row: usize, dest: &mut Column, dest_row: usize) {
        match (self, dest) {
            (Column::Unmanaged(src), Column::Unmanaged(dst)) => {
                debug_assert_eq!(src.elem_size, dst.elem_size);
                if src.elem_size == 0 {
                    return;
                }
                // SAFETY: distinct allocations, each row is `elem_size` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(src.row_ptr(row), dst.row_ptr(dest_row), src.elem_size)
                }
            }
            (Column::Managed(src), Column::Managed(dst)) => {
                src.move_row(row, &mut **dst, dest_row)
            }
            _ => panic!("copy_row between columns of different storage kinds"),
        }
    }

    /// Swap-remove support: move `last` into `hole` and reset `last`.
    pub(crate) fn fill_hole(&mut self, hole: usize, last: usize) {
        match self {
            Column::Unmanaged(raw) => {
                if hole != last && raw.elem_size != 0 {
                    // SAFETY: distinct rows of the same allocation.
                    unsafe {
                        ptr::copy_nonoverlapping(raw.row_ptr(last), raw.row_ptr(hole), raw.elem_size)
                    }
                }
                raw.reset(last);
            }
            Column::Managed(m) => m.fill_hole(hole, last),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
