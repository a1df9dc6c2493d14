//! The trait surface this crate expects from the underlying WASM execution
//! engine. Parsing, linking, and running WebAssembly are out of scope
//! (spec.md §1) — these traits are the boundary an embedder's engine
//! binding (e.g. a `wasmtime`/`wasmer` adapter) implements.

use crate::error::AbiResult;
use crate::flat::{FlatType, FlatValue};

/// A guest linear-memory address. Opaque outside this crate's memory
/// façade; see [`crate::allocator`] and [`crate::encode`]/[`crate::decode`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct GuestPointer(pub u32);

impl GuestPointer {
    pub const NULL: GuestPointer = GuestPointer(0);

    /// The address `size` bytes past this one.
    pub fn advance(self, size: u32) -> Self {
        GuestPointer(self.0.wrapping_add(size))
    }

    /// This address rounded up to `alignment` (a power of two).
    pub fn align_to(self, alignment: u32) -> Self {
        GuestPointer(crate::layout::align_up(self.0, alignment))
    }

    /// The address of the `index`-th element of a contiguous array of
    /// `element_size`-byte, `element_alignment`-aligned elements starting
    /// at this address.
    pub fn index(self, index: u32, element_size: u32, element_alignment: u32) -> Self {
        let stride = crate::layout::align_up(element_size, element_alignment);
        GuestPointer(self.0.wrapping_add(index.wrapping_mul(stride)))
    }
}

/// A runtime's notion of "the instance's exported linear memory". Reads
/// and writes are bounds-checked by the implementation and reported via
/// [`AbiResult`], not panics — guest memory is attacker-controlled input.
pub trait RuntimeMemory {
    /// Reads `length` bytes starting at `location`.
    fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>>;

    /// Writes `bytes` starting at `location`.
    fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()>;

    /// The size of linear memory in bytes, used for bounds pre-checks in
    /// the dispatcher's fast paths.
    fn size(&self) -> u32;
}

/// An instance that exposes its linear memory to the host.
pub trait InstanceWithMemory {
    type Memory: RuntimeMemory;

    fn memory(&self) -> &Self::Memory;
    fn memory_mut(&mut self) -> &mut Self::Memory;
}

/// Invocation of a named guest export with a caller-supplied flat value
/// stack — "exported function invocation with a caller-supplied flat
/// value stack" (spec.md §1).
pub trait InstanceWithFunction {
    /// An opaque handle to a resolved export, cached by callers across
    /// invocations (spec.md §4.C "compiled plan").
    type Function: Clone;

    /// Resolves `name` to a callable [`Self::Function`], failing if the
    /// export does not exist or its flat signature cannot be checked.
    fn load_function(&self, name: &str) -> AbiResult<Self::Function>;

    /// Invokes `function` with `args`, returning its flat results.
    fn call(&mut self, function: &Self::Function, args: &[FlatValue]) -> AbiResult<Vec<FlatValue>>;
}

/// The memory access a host function import is handed at call time —
/// analogous to wasmtime's `Caller<'_, T>`, but reduced to exactly the
/// façade the lifter/lowerer need. The engine binding constructs one of
/// these per invocation from whatever the guest's call context actually
/// is; this crate never constructs a guest instance itself.
pub trait RawGuestMemory {
    fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>>;
    fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()>;
    fn alloc(&mut self, size: u32, align: u32) -> AbiResult<GuestPointer>;
    fn free(&mut self, ptr: GuestPointer, size: u32, align: u32) -> AbiResult<()>;
}

/// Registration of a native host function with the engine, "with explicit
/// flat parameter/result types" (spec.md §1) so the engine can type-check
/// the import against what the guest declared.
pub trait HostFunctionRegistrar {
    /// A boxed native closure invoked on behalf of the guest. Receives
    /// memory access for the calling instance plus the flat argument
    /// slots, and returns the flat result slots (or an error, which the
    /// engine should surface as a guest trap).
    type HostClosure: Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>>
        + Send
        + Sync
        + 'static;

    /// Registers `closure` under `namespace`/`name`, declaring its flat
    /// parameter and result slot types so the engine can validate the
    /// guest's import declaration against them.
    fn register(
        &mut self,
        namespace: &str,
        name: &str,
        params: &[FlatType],
        results: &[FlatType],
        closure: Self::HostClosure,
    ) -> AbiResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_pointer_index_respects_stride_alignment() {
        let base = GuestPointer(8);
        // 3-byte elements, 4-byte aligned -> stride 4.
        assert_eq!(base.index(0, 3, 4), GuestPointer(8));
        assert_eq!(base.index(1, 3, 4), GuestPointer(12));
        assert_eq!(base.index(2, 3, 4), GuestPointer(16));
    }

    #[test]
    fn guest_pointer_align_to_rounds_up() {
        assert_eq!(GuestPointer(5).align_to(4), GuestPointer(8));
        assert_eq!(GuestPointer(8).align_to(4), GuestPointer(8));
    }
}
