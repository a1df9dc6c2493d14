//! An in-memory, no-real-WASM-engine `Instance` used by the integration
//! suite in `tests/` (spec.md §8's concrete end-to-end scenarios). Its
//! bump-pointer `cabi_realloc` mirrors the grow-only `REALLOC_AND_FREE`
//! allocator wasmtime's own component-model tests use, reimplemented here
//! in plain Rust instead of WAT.
//!
//! Guest exports and host imports are both plain Rust closures — there is
//! no WASM bytecode anywhere in this module. Registering an "export" here
//! means writing, by hand, the Rust equivalent of what a real guest
//! module compiled for that signature would do.

use std::collections::HashMap;
use std::rc::Rc;

use crate::engine::{
    GuestPointer, HostFunctionRegistrar, InstanceWithFunction, InstanceWithMemory, RawGuestMemory, RuntimeMemory,
};
use crate::error::{AbiError, AbiResult};
use crate::flat::{FlatType, FlatValue};
use crate::layout::align_up;
use crate::names::namespace_satisfies;

/// A flat `Vec<u8>` linear memory with bounds-checked access.
pub struct FakeMemory {
    bytes: Vec<u8>,
}

impl FakeMemory {
    fn new(size: u32) -> Self {
        FakeMemory { bytes: vec![0u8; size as usize] }
    }
}

impl RuntimeMemory for FakeMemory {
    fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
        let start = location.0 as usize;
        let end = start + length as usize;
        self.bytes
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| AbiError::internal(format!("read out of bounds: {start}..{end} in {}-byte memory", self.bytes.len())))
    }

    fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
        let start = location.0 as usize;
        let end = start + bytes.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(bytes);
        Ok(())
    }

    fn size(&self) -> u32 {
        self.bytes.len() as u32
    }
}

/// What a guest-export closure is handed: raw access to linear memory and
/// the bump pointer, plus a way to invoke a registered host import, the
/// same shape a real guest calling out through a canonical-ABI import
/// would have.
pub struct FakeCallEnv<'a> {
    memory: &'a mut FakeMemory,
    bump: &'a mut u32,
    imports: &'a HostImportTable,
}

impl<'a> FakeCallEnv<'a> {
    /// Bump-allocates `size` bytes aligned to `align`, growing memory as
    /// needed. Never frees — a deliberate simplification of the bump
    /// allocator (nothing in the test scenarios exercises reuse).
    pub fn alloc(&mut self, size: u32, align: u32) -> GuestPointer {
        let ptr = align_up(*self.bump, align.max(1));
        *self.bump = ptr + size;
        if (*self.bump as usize) > self.memory.bytes.len() {
            self.memory.bytes.resize(*self.bump as usize, 0);
        }
        GuestPointer(ptr)
    }

    pub fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
        self.memory.read(location, length)
    }

    pub fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
        self.memory.write(location, bytes)
    }

    /// Calls a host import previously registered with [`FakeInstance::register`],
    /// the way a compiled guest export calling out through a WIT import
    /// would (spec.md §8's "host-import fast path" scenario).
    pub fn call_import(&mut self, namespace: &str, name: &str, args: &[FlatValue]) -> AbiResult<Vec<FlatValue>> {
        let closure = self.imports.find(namespace, name)?;
        let mut raw = RawFakeMemory {
            memory: self.memory,
            bump: self.bump,
        };
        closure(&mut raw, args)
    }
}

/// [`RawGuestMemory`] view handed to a registered host import closure.
struct RawFakeMemory<'a> {
    memory: &'a mut FakeMemory,
    bump: &'a mut u32,
}

impl<'a> RawGuestMemory for RawFakeMemory<'a> {
    fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
        self.memory.read(location, length)
    }

    fn write(&mut self, location: GuestPointer, bytes: &[u8]) -> AbiResult<()> {
        self.memory.write(location, bytes)
    }

    fn alloc(&mut self, size: u32, align: u32) -> AbiResult<GuestPointer> {
        let ptr = align_up(*self.bump, align.max(1));
        *self.bump = ptr + size;
        if (*self.bump as usize) > self.memory.bytes.len() {
            self.memory.bytes.resize(*self.bump as usize, 0);
        }
        Ok(GuestPointer(ptr))
    }

    fn free(&mut self, _ptr: GuestPointer, _size: u32, _align: u32) -> AbiResult<()> {
        Ok(())
    }
}

type GuestFn = dyn Fn(&mut FakeCallEnv, &[FlatValue]) -> AbiResult<Vec<FlatValue>>;

/// A resolved guest export handle. Cheaply [`Clone`]able, as
/// [`InstanceWithFunction::Function`] requires.
#[derive(Clone)]
pub struct FakeFunction(Rc<GuestFn>);

type ImportClosure = dyn Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync;

#[derive(Default)]
struct HostImportTable {
    entries: Vec<(String, String, Box<ImportClosure>)>,
}

impl HostImportTable {
    fn register(&mut self, namespace: &str, name: &str, closure: Box<ImportClosure>) {
        self.entries.push((namespace.to_string(), name.to_string(), closure));
    }

    fn find(&self, namespace: &str, name: &str) -> AbiResult<&ImportClosure> {
        self.entries
            .iter()
            .find(|(registered_namespace, registered_name, _)| {
                registered_name == name && namespace_satisfies(registered_namespace, namespace)
            })
            .map(|(_, _, closure)| closure.as_ref())
            .ok_or_else(|| AbiError::invalid(format!("no host import registered for {namespace}#{name}")))
    }
}

/// An in-memory stand-in for a guest instance, with a bump-pointer
/// allocator pre-registered under the canonical `cabi_realloc`/`cabi_free`
/// names.
pub struct FakeInstance {
    memory: FakeMemory,
    bump: u32,
    exports: HashMap<String, FakeFunction>,
    imports: HostImportTable,
}

impl FakeInstance {
    /// Builds an instance with `memory_size` bytes of linear memory and
    /// the bump allocator already registered as `cabi_realloc`/`cabi_free`.
    pub fn new(memory_size: u32) -> Self {
        let mut instance = FakeInstance {
            memory: FakeMemory::new(memory_size),
            bump: 0,
            exports: HashMap::new(),
            imports: HostImportTable::default(),
        };
        instance.export("cabi_realloc", |env, args| {
            let old_ptr = args[0].as_u32();
            let old_size = args[1].as_u32();
            let align = args[2].as_u32();
            let new_size = args[3].as_u32();
            if new_size == 0 {
                return Ok(vec![FlatValue::I32(0)]);
            }
            let new_ptr = env.alloc(new_size, align);
            if old_ptr != 0 && old_size > 0 {
                let old_bytes = env.read(GuestPointer(old_ptr), old_size)?;
                env.write(new_ptr, &old_bytes)?;
            }
            Ok(vec![FlatValue::I32(new_ptr.0)])
        });
        instance.export("cabi_free", |_env, _args| Ok(vec![]));
        instance
    }

    /// Registers a guest export under `name`.
    pub fn export(&mut self, name: &str, closure: impl Fn(&mut FakeCallEnv, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + 'static) {
        self.exports.insert(name.to_string(), FakeFunction(Rc::new(closure)));
    }
}

impl InstanceWithMemory for FakeInstance {
    type Memory = FakeMemory;

    fn memory(&self) -> &Self::Memory {
        &self.memory
    }

    fn memory_mut(&mut self) -> &mut Self::Memory {
        &mut self.memory
    }
}

impl InstanceWithFunction for FakeInstance {
    type Function = FakeFunction;

    fn load_function(&self, name: &str) -> AbiResult<Self::Function> {
        self.exports
            .get(name)
            .cloned()
            .ok_or_else(|| AbiError::invalid(format!("no such export: {name}")))
    }

    fn call(&mut self, function: &Self::Function, args: &[FlatValue]) -> AbiResult<Vec<FlatValue>> {
        let closure = function.0.clone();
        let mut env = FakeCallEnv {
            memory: &mut self.memory,
            bump: &mut self.bump,
            imports: &self.imports,
        };
        closure(&mut env, args)
    }
}

impl HostFunctionRegistrar for FakeInstance {
    type HostClosure = Box<ImportClosure>;

    fn register(
        &mut self,
        namespace: &str,
        name: &str,
        _params: &[FlatType],
        _results: &[FlatType],
        closure: Self::HostClosure,
    ) -> AbiResult<()> {
        self.imports.register(namespace, name, closure);
        Ok(())
    }
}

/// Adapts a [`host_binder`](crate::host_binder)-style closure (built with
/// `Send + Sync`, for a real multi-threaded engine) into the
/// [`HostFunctionRegistrar::HostClosure`] shape this harness expects.
pub fn boxed_import<F>(closure: F) -> Box<ImportClosure>
where
    F: Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static,
{
    Box::new(closure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocator_grows_memory_and_never_reuses() {
        let mut instance = FakeInstance::new(64);
        let realloc = instance.load_function("cabi_realloc").unwrap();
        let first = instance
            .call(&realloc, &[FlatValue::I32(0), FlatValue::I32(0), FlatValue::I32(4), FlatValue::I32(8)])
            .unwrap();
        let second = instance
            .call(&realloc, &[FlatValue::I32(0), FlatValue::I32(0), FlatValue::I32(4), FlatValue::I32(8)])
            .unwrap();
        assert_ne!(first[0].as_u32(), second[0].as_u32());
    }

    #[test]
    fn registered_export_round_trips_through_memory() {
        let mut instance = FakeInstance::new(64);
        instance.export("double", |env, args| {
            let ptr = GuestPointer(args[0].as_u32());
            let bytes = env.read(ptr, 4)?;
            let value = u32::from_le_bytes(bytes.try_into().unwrap());
            Ok(vec![FlatValue::I32(value * 2)])
        });
        instance.memory_mut().write(GuestPointer(0), &21u32.to_le_bytes()).unwrap();
        let double = instance.load_function("double").unwrap();
        let results = instance.call(&double, &[FlatValue::I32(0)]).unwrap();
        assert_eq!(results[0].as_u32(), 42);
    }

    #[test]
    fn host_import_is_reachable_from_a_guest_export() {
        let mut instance = FakeInstance::new(64);
        instance
            .register(
                "host",
                "double",
                &[],
                &[],
                boxed_import(|_memory, args| Ok(vec![FlatValue::I32(args[0].as_u32() * 2)])),
            )
            .unwrap();
        instance.export("call-host-double", |env, args| env.call_import("host", "double", args));
        let function = instance.load_function("call-host-double").unwrap();
        let results = instance.call(&function, &[FlatValue::I32(21)]).unwrap();
        assert_eq!(results[0].as_u32(), 42);
    }
}
