//! The allocator façade (spec.md §4.F): a uniform `alloc`/`free` over
//! either the canonical four-argument reallocator or a legacy
//! single-argument allocator, plus a scoped allocation list that frees
//! everything it tracked if a call fails partway through.

use crate::engine::{GuestPointer, InstanceWithFunction};
use crate::error::{AbiError, AbiResult};
use crate::flat::FlatValue;

/// Guest export names searched for the reallocator/allocator/free
/// functions, in precedence order (spec.md §6).
pub const REALLOC_NAMES: &[&str] = &["cabi_realloc", "canonical_abi_realloc", "allocate", "alloc"];
pub const FREE_NAMES: &[&str] = &["cabi_free", "deallocate", "free"];

/// Which calling convention the guest's allocator export uses.
#[derive(Clone, Debug)]
enum AllocatorKind<F> {
    /// `(old_ptr, old_size, align, new_size) -> new_ptr`.
    Reallocator(F),
    /// `(size) -> ptr`, with an optional separate `(ptr) -> ()` free.
    LegacyAllocator { alloc: F, free: Option<F> },
}

/// The uniform allocator surface presented to the encoder/decoder,
/// detected once per instance from whichever guest export is available.
pub struct Allocator<Instance: InstanceWithFunction> {
    kind: AllocatorKind<Instance::Function>,
}

impl<Instance: InstanceWithFunction> Allocator<Instance> {
    /// Detects and resolves the guest's allocator export, trying
    /// [`REALLOC_NAMES`] before [`FREE_NAMES`]'s legacy allocator form.
    /// A function accepting fewer than 4 parameters is treated as the
    /// legacy single-argument allocator (spec.md §6).
    pub fn detect(instance: &Instance, arity_is_legacy: impl Fn(&str) -> bool) -> AbiResult<Self> {
        for name in REALLOC_NAMES {
            if let Ok(function) = instance.load_function(name) {
                if arity_is_legacy(name) {
                    let free = FREE_NAMES.iter().find_map(|n| instance.load_function(n).ok());
                    return Ok(Allocator {
                        kind: AllocatorKind::LegacyAllocator {
                            alloc: function,
                            free,
                        },
                    });
                }
                return Ok(Allocator {
                    kind: AllocatorKind::Reallocator(function),
                });
            }
        }
        Err(AbiError::resource_exhausted(
            "guest module exports no recognized allocator",
        ))
    }

    /// Allocates `size` bytes aligned to `align` in the guest's linear
    /// memory, fresh (i.e. with `old_ptr = 0`) for the reallocator form.
    pub fn alloc(
        &self,
        instance: &mut Instance,
        size: u32,
        align: u32,
    ) -> AbiResult<GuestPointer> {
        let address = match &self.kind {
            AllocatorKind::Reallocator(function) => {
                let args = [
                    FlatValue::I32(0),
                    FlatValue::I32(0),
                    FlatValue::I32(align),
                    FlatValue::I32(size),
                ];
                let results = instance.call(function, &args)?;
                results.first().map(FlatValue::as_u32).unwrap_or(0)
            }
            AllocatorKind::LegacyAllocator { alloc, .. } => {
                let args = [FlatValue::I32(size)];
                let results = instance.call(alloc, &args)?;
                results.first().map(FlatValue::as_u32).unwrap_or(0)
            }
        };
        if address == 0 && size != 0 {
            return Err(AbiError::resource_exhausted(
                "guest allocator returned a null pointer",
            ));
        }
        Ok(GuestPointer(address))
    }

    /// Frees a previously-[`alloc`](Self::alloc)ed block.
    pub fn free(
        &self,
        instance: &mut Instance,
        ptr: GuestPointer,
        size: u32,
        align: u32,
    ) -> AbiResult<()> {
        match &self.kind {
            AllocatorKind::Reallocator(function) => {
                let args = [
                    FlatValue::I32(ptr.0),
                    FlatValue::I32(size),
                    FlatValue::I32(align),
                    FlatValue::I32(0),
                ];
                instance.call(function, &args)?;
                Ok(())
            }
            AllocatorKind::LegacyAllocator { free: Some(free), .. } => {
                instance.call(free, &[FlatValue::I32(ptr.0)])?;
                Ok(())
            }
            AllocatorKind::LegacyAllocator { free: None, .. } => {
                // No free export: legacy allocate-only guests leak by
                // design (spec.md §6 only requires a free name "if
                // exported").
                Ok(())
            }
        }
    }
}

/// One allocation made on behalf of the current call, tracked so it can
/// be freed if the call fails before ownership transfers to the guest.
#[derive(Clone, Copy, Debug)]
struct Allocation {
    ptr: GuestPointer,
    size: u32,
    align: u32,
}

/// Scoped record of every allocation performed during a single
/// lower/call, so a failure partway through can unwind them all
/// (spec.md §4.F/§8 "allocator contract").
#[derive(Default)]
pub struct AllocList {
    allocations: Vec<Allocation>,
}

impl AllocList {
    pub fn new() -> Self {
        AllocList::default()
    }

    /// Allocates through `allocator` and records the allocation.
    pub fn alloc<Instance: InstanceWithFunction>(
        &mut self,
        allocator: &Allocator<Instance>,
        instance: &mut Instance,
        size: u32,
        align: u32,
    ) -> AbiResult<GuestPointer> {
        let ptr = allocator.alloc(instance, size, align)?;
        self.allocations.push(Allocation { ptr, size, align });
        Ok(ptr)
    }

    /// Frees every allocation recorded so far, in reverse order. Used on
    /// the error path of an encode/dispatch (spec.md §4.D: "On error the
    /// encoder must invoke `alloc_list.free_all`").
    pub fn free_all<Instance: InstanceWithFunction>(
        &mut self,
        allocator: &Allocator<Instance>,
        instance: &mut Instance,
    ) {
        for allocation in self.allocations.drain(..).rev() {
            // Best-effort: a failure while unwinding must not mask the
            // original error, so failures here are swallowed.
            let _ = allocator.free(instance, allocation.ptr, allocation.size, allocation.align);
        }
    }

    /// Releases the list without freeing anything: ownership of every
    /// tracked allocation has transferred to the guest (spec.md §3
    /// ownership rules).
    pub fn release(mut self) {
        self.allocations.clear();
    }

    /// Number of allocations recorded so far, used by the allocator
    /// contract test (spec.md §8).
    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}
