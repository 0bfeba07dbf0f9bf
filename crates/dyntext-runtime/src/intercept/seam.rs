//! The single place where the engine writes into host memory.

use std::mem::size_of;

use super::HookError;

/// One entry of a dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DispatchTarget {
    table: usize,
    slot: usize,
}

impl DispatchTarget {
    #[must_use]
    pub const fn new(table: usize, slot: usize) -> Self {
        Self { table, slot }
    }

    /// Address of the table.
    #[must_use]
    pub const fn table(&self) -> usize {
        self.table
    }

    #[must_use]
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Address of the entry itself.
    #[must_use]
    pub const fn slot_addr(&self) -> usize {
        self.table + self.slot * size_of::<usize>()
    }

    pub(crate) fn slot_ptr(&self) -> *mut usize {
        self.slot_addr() as *mut usize
    }
}

/// Record of a completed slot swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotHook {
    target: DispatchTarget,
    original: usize,
    replacement: usize,
}

impl SlotHook {
    #[must_use]
    pub const fn new(target: DispatchTarget, original: usize, replacement: usize) -> Self {
        Self {
            target,
            original,
            replacement,
        }
    }

    #[must_use]
    pub const fn target(&self) -> DispatchTarget {
        self.target
    }

    /// Value the slot held before the swap.
    #[must_use]
    pub const fn original(&self) -> usize {
        self.original
    }

    #[must_use]
    pub const fn replacement(&self) -> usize {
        self.replacement
    }
}

/// Writes a replacement function pointer into a dispatch-table slot.
pub trait InterceptionSeam: Send + Sync {
    /// Swaps the value at `target` for `replacement`, returning the previous
    /// value in the [`SlotHook`]. Memory protection is restored afterwards.
    ///
    /// # Safety
    ///
    /// `target` must name a slot inside a live dispatch table, and
    /// `replacement` must be a function with the same signature as the
    /// function it replaces.
    unsafe fn install(
        &self,
        target: DispatchTarget,
        replacement: usize,
    ) -> Result<SlotHook, HookError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_addr_is_word_indexed() {
        let target = DispatchTarget::new(0x1000, 2);

        assert_eq!(target.slot_addr(), 0x1000 + 2 * size_of::<usize>());
        assert_eq!(target.table(), 0x1000);
        assert_eq!(target.slot(), 2);
    }
}
