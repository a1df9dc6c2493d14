//! A convenience façade over an instance's linear memory plus its
//! allocator, the handle the encoder/decoder thread through a call
//! (spec.md §3 "Guest linear memory is owned by the instance; host code
//! reads/writes through the memory façade").

use crate::allocator::{AllocList, Allocator};
use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory, RuntimeMemory};
use crate::error::AbiResult;

/// Borrows an instance's memory and allocator for the duration of a call.
/// Never outlives the call it was built for (spec.md §3's "borrows" rule).
pub struct Memory<'instance, Instance>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    instance: &'instance mut Instance,
    allocator: &'instance Allocator<Instance>,
}

impl<'instance, Instance> Memory<'instance, Instance>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    pub fn new(instance: &'instance mut Instance, allocator: &'instance Allocator<Instance>) -> Self {
        Memory { instance, allocator }
    }

    /// Reads `length` bytes from `location`.
    pub fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
        self.instance.memory().read(location, length)
    }

    /// Writes `bytes` at `location`.
    pub fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
        self.instance.memory_mut().write(location, bytes)
    }

    /// Allocates `size` bytes aligned to `align`, tracked by `alloc_list`
    /// so a later failure can free it (spec.md §4.F).
    pub fn allocate(
        &mut self,
        alloc_list: &mut AllocList,
        size: u32,
        align: u32,
    ) -> AbiResult<GuestPointer> {
        alloc_list.alloc(self.allocator, self.instance, size, align)
    }

    /// Direct, untracked allocation — used only for the result buffer of
    /// an indirect return, whose ownership always ends up with the guest
    /// (no failure path needs to free it, it's written into before the
    /// call even begins).
    pub fn allocate_untracked(&mut self, size: u32, align: u32) -> AbiResult<GuestPointer> {
        self.allocator.alloc(self.instance, size, align)
    }

    /// Frees every allocation tracked by `alloc_list` against this
    /// instance's allocator, used on the encoder's error path.
    pub fn free_all_tracked(&mut self, alloc_list: &mut AllocList) {
        alloc_list.free_all(self.allocator, self.instance);
    }

    /// Frees a single block directly (used by the decoder when a
    /// zero-copy view has to fall back to copying and releasing a
    /// scratch buffer; the common "free everything on error" path goes
    /// through [`AllocList::free_all`] instead).
    pub fn free(&mut self, ptr: GuestPointer, size: u32, align: u32) -> AbiResult<()> {
        self.allocator.free(self.instance, ptr, size, align)
    }

    /// Total size of linear memory, for bounds pre-checks.
    pub fn memory_size(&self) -> u32 {
        self.instance.memory().size()
    }

    /// The underlying instance, for invoking exported functions directly
    /// (used by the dispatcher).
    pub fn instance(&mut self) -> &mut Instance {
        self.instance
    }
}
