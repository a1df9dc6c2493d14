//! The call dispatcher (spec.md §4.G): resolves a guest export once,
//! caches its plan, and picks the cheapest of a fast path / compiled
//! aggregate path / general path for each call.

use tracing::trace;

use crate::allocator::{AllocList, Allocator};
use crate::compiler::TypeCompiler;
use crate::config::HostConfig;
use crate::decode::{decode_results, load_value};
use crate::encode::lower_to_stack;
use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::FlatValue;
use crate::flatten::uses_retptr;
use crate::layout::{align_up, layout};
use crate::memory::Memory;
use crate::native::WitType;
use crate::value::Value;
use crate::wit_type::WitTypeDef;

/// The scalar shapes the fast-path family (spec.md §4.G step 2) is
/// specialized for: `u32`/`s32`/`u64`/`s64`/`bool`, each a single flat
/// slot with no guest-memory traffic at all.
pub trait FastScalar: Sized {
    fn to_flat(&self) -> FlatValue;
    fn from_flat(value: FlatValue) -> Self;
}

macro_rules! impl_fast_scalar {
    ($ty:ty, $flat:ident, $as_fn:ident) => {
        impl FastScalar for $ty {
            fn to_flat(&self) -> FlatValue {
                FlatValue::$flat(*self as _)
            }
            fn from_flat(value: FlatValue) -> Self {
                value.$as_fn() as $ty
            }
        }
    };
}

impl_fast_scalar!(u32, I32, as_u32);
impl_fast_scalar!(i32, I32, as_i32);
impl_fast_scalar!(u64, I64, as_u64);
impl_fast_scalar!(i64, I64, as_i64);

impl FastScalar for bool {
    fn to_flat(&self) -> FlatValue {
        FlatValue::I32(*self as u32)
    }
    fn from_flat(value: FlatValue) -> Self {
        value.as_u32() != 0
    }
}

/// Resolves and invokes guest exports, caching each export's resolved
/// [`InstanceWithFunction::Function`] handle by name (spec.md §4.C/§4.G
/// "resolves/caches a function plan").
pub struct Dispatcher<Instance: InstanceWithFunction> {
    compiler: TypeCompiler,
    config: HostConfig,
    functions: std::sync::RwLock<std::collections::HashMap<String, Instance::Function>>,
}

impl<Instance: InstanceWithFunction> Dispatcher<Instance> {
    pub fn new(config: HostConfig) -> Self {
        Dispatcher {
            compiler: TypeCompiler::new(),
            config,
            functions: std::sync::RwLock::new(std::collections::HashMap::new()),
        }
    }

    fn resolve(&self, instance: &Instance, name: &str) -> AbiResult<Instance::Function> {
        if let Some(function) = self
            .functions
            .read()
            .map_err(|_| AbiError::internal("dispatcher function cache lock poisoned"))?
            .get(name)
        {
            return Ok(function.clone());
        }
        let function = instance.load_function(name)?;
        self.functions
            .write()
            .map_err(|_| AbiError::internal("dispatcher function cache lock poisoned"))?
            .insert(name.to_string(), function.clone());
        Ok(function)
    }
}

impl<Instance> Dispatcher<Instance>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    /// Calls the guest export `name`, lowering `params` and lifting the
    /// result per the general path (spec.md §4.G step 4): encode, invoke,
    /// then either decode flat results directly or read them back from
    /// guest memory at a return pointer, depending on
    /// [`uses_retptr`].
    pub fn call<Params, Results>(
        &self,
        instance: &mut Instance,
        allocator: &Allocator<Instance>,
        name: &str,
        params: Params,
    ) -> AbiResult<Results>
    where
        Params: WitType + 'static,
        Results: WitType + 'static,
    {
        self.call_generic(instance, allocator, name, params, None)
    }

    /// Like [`Dispatcher::call`], but for a caller that already owns (and
    /// wants to reuse across calls) the indirect-return destination
    /// buffer — the "into" family that "accepts a pre-allocated
    /// destination pointer and skips allocating a boxed return" (spec.md
    /// §4.G). Ignored when `Results`' shape doesn't need a return pointer
    /// at all.
    pub fn call_into<Params, Results>(
        &self,
        instance: &mut Instance,
        allocator: &Allocator<Instance>,
        name: &str,
        params: Params,
        dest: GuestPointer,
    ) -> AbiResult<Results>
    where
        Params: WitType + 'static,
        Results: WitType + 'static,
    {
        self.call_generic(instance, allocator, name, params, Some(dest))
    }

    fn call_generic<Params, Results>(
        &self,
        instance: &mut Instance,
        allocator: &Allocator<Instance>,
        name: &str,
        params: Params,
        dest: Option<GuestPointer>,
    ) -> AbiResult<Results>
    where
        Params: WitType + 'static,
        Results: WitType + 'static,
    {
        trace!(function = name, "dispatching guest call");
        let function = self.resolve(instance, name)?;
        let param_value = params.to_value();
        let param_plan = self.compiler.compile::<Params>()?;
        let result_plan = self.compiler.compile::<Results>()?;
        let result_types = flatten_top_level(&result_plan.wit_type);

        let mut memory = Memory::new(instance, allocator);
        let mut alloc_list = AllocList::new();

        let mut args = match lower_to_stack(&param_plan.wit_type, &param_value, &mut memory, &mut alloc_list) {
            Ok(args) => args,
            Err(error) => return Err(error),
        };

        let result_value = if uses_retptr(&result_types, self.config.max_flat_results) {
            let retptr = match dest {
                Some(ptr) => ptr,
                None => match memory.allocate_untracked(result_plan.layout.size.max(1), result_plan.layout.alignment.max(1)) {
                    Ok(ptr) => ptr,
                    Err(error) => {
                        memory.free_all_tracked(&mut alloc_list);
                        return Err(error);
                    }
                },
            };
            args.push(FlatValue::I32(retptr.0));
            match memory.instance().call(&function, &args) {
                Ok(_) if result_plan.is_word_reconstructible() => {
                    match memory.read(retptr, result_plan.layout.size.max(1)) {
                        Ok(bytes) => match decode_word_reconstructed(&result_plan.wit_type, &bytes) {
                            Ok(value) => value,
                            Err(error) => {
                                memory.free_all_tracked(&mut alloc_list);
                                return Err(error);
                            }
                        },
                        Err(error) => {
                            memory.free_all_tracked(&mut alloc_list);
                            return Err(error);
                        }
                    }
                }
                Ok(_) => match load_value(&result_plan.wit_type, retptr, &memory) {
                    Ok(value) => value,
                    Err(error) => {
                        memory.free_all_tracked(&mut alloc_list);
                        return Err(error);
                    }
                },
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        } else {
            match memory.instance().call(&function, &args) {
                Ok(slots) => match decode_top_level(&result_plan.wit_type, &slots, &memory) {
                    Ok(value) => value,
                    Err(error) => {
                        memory.free_all_tracked(&mut alloc_list);
                        return Err(error);
                    }
                },
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        };

        alloc_list.release();
        Results::from_value(result_value)
    }

    /// Access to this dispatcher's type-compiler cache, for callers that
    /// want to pre-warm it outside the critical path of a first call.
    pub fn compiler(&self) -> &TypeCompiler {
        &self.compiler
    }

    /// Fast path for `(string) -> string` handlers (spec.md §4.G step 2),
    /// reading and writing UTF-8 bytes directly rather than going through
    /// `Value`/`WitTypeDef` dispatch.
    pub fn call_string_to_string(
        &self,
        instance: &mut Instance,
        allocator: &Allocator<Instance>,
        name: &str,
        input: &str,
    ) -> AbiResult<String> {
        let function = self.resolve(instance, name)?;
        let mut memory = Memory::new(instance, allocator);
        let mut alloc_list = AllocList::new();

        let in_ptr = match memory.allocate(&mut alloc_list, input.len().max(1) as u32, 1) {
            Ok(ptr) => ptr,
            Err(error) => return Err(error),
        };
        if !input.is_empty() {
            if let Err(error) = memory.write(in_ptr, input.as_bytes()) {
                memory.free_all_tracked(&mut alloc_list);
                return Err(error);
            }
        }
        let mut args = vec![FlatValue::I32(in_ptr.0), FlatValue::I32(input.len() as u32)];

        let result = if uses_retptr(&[WitTypeDef::String], self.config.max_flat_results) {
            let retptr = match memory.allocate_untracked(8, 4) {
                Ok(ptr) => ptr,
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            };
            args.push(FlatValue::I32(retptr.0));
            match memory.instance().call(&function, &args) {
                Ok(_) => read_flat_string_result(&memory, retptr.0, retptr.advance(4).0),
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        } else {
            match memory.instance().call(&function, &args) {
                Ok(slots) => {
                    let out_ptr = slots.first().ok_or_else(|| AbiError::internal("fast string path got no result slots"))?.as_u32();
                    let out_len = slots.get(1).ok_or_else(|| AbiError::internal("fast string path got no length slot"))?.as_u32();
                    read_flat_string(&memory, out_ptr, out_len)
                }
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        };
        match result {
            Ok(s) => {
                alloc_list.release();
                Ok(s)
            }
            Err(error) => {
                memory.free_all_tracked(&mut alloc_list);
                Err(error)
            }
        }
    }

    /// Fast path for `(string, string) -> string` handlers (spec.md §4.G
    /// step 2).
    pub fn call_string_string_to_string(
        &self,
        instance: &mut Instance,
        allocator: &Allocator<Instance>,
        name: &str,
        a: &str,
        b: &str,
    ) -> AbiResult<String> {
        let function = self.resolve(instance, name)?;
        let mut memory = Memory::new(instance, allocator);
        let mut alloc_list = AllocList::new();

        let a_ptr = match memory.allocate(&mut alloc_list, a.len().max(1) as u32, 1) {
            Ok(ptr) => ptr,
            Err(error) => return Err(error),
        };
        let b_ptr = match memory.allocate(&mut alloc_list, b.len().max(1) as u32, 1) {
            Ok(ptr) => ptr,
            Err(error) => {
                memory.free_all_tracked(&mut alloc_list);
                return Err(error);
            }
        };
        for (ptr, s) in [(a_ptr, a), (b_ptr, b)] {
            if !s.is_empty() {
                if let Err(error) = memory.write(ptr, s.as_bytes()) {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        }
        let mut args = vec![
            FlatValue::I32(a_ptr.0),
            FlatValue::I32(a.len() as u32),
            FlatValue::I32(b_ptr.0),
            FlatValue::I32(b.len() as u32),
        ];

        let result = if uses_retptr(&[WitTypeDef::String], self.config.max_flat_results) {
            let retptr = match memory.allocate_untracked(8, 4) {
                Ok(ptr) => ptr,
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            };
            args.push(FlatValue::I32(retptr.0));
            match memory.instance().call(&function, &args) {
                Ok(_) => read_flat_string_result(&memory, retptr.0, retptr.advance(4).0),
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        } else {
            match memory.instance().call(&function, &args) {
                Ok(slots) => {
                    let out_ptr = slots.first().ok_or_else(|| AbiError::internal("fast string path got no result slots"))?.as_u32();
                    let out_len = slots.get(1).ok_or_else(|| AbiError::internal("fast string path got no length slot"))?.as_u32();
                    read_flat_string(&memory, out_ptr, out_len)
                }
                Err(error) => {
                    memory.free_all_tracked(&mut alloc_list);
                    return Err(error);
                }
            }
        };
        match result {
            Ok(s) => {
                alloc_list.release();
                Ok(s)
            }
            Err(error) => {
                memory.free_all_tracked(&mut alloc_list);
                Err(error)
            }
        }
    }
}

impl<Instance: InstanceWithFunction> Dispatcher<Instance> {
    /// Fast path for `() -> T` handlers (spec.md §4.G step 2): `T` is
    /// read straight off the single returned flat slot, skipping the
    /// general path's `Value`/`WitTypeDef` round trip entirely.
    pub fn call_fast0<R: FastScalar>(&self, instance: &mut Instance, name: &str) -> AbiResult<R> {
        let function = self.resolve(instance, name)?;
        let results = instance.call(&function, &[])?;
        let slot = results
            .first()
            .copied()
            .ok_or_else(|| AbiError::internal("fast path `() -> T` got no result slots"))?;
        Ok(R::from_flat(slot))
    }

    /// Fast path for `(T) -> R` handlers.
    pub fn call_fast1<T: FastScalar, R: FastScalar>(&self, instance: &mut Instance, name: &str, a: T) -> AbiResult<R> {
        let function = self.resolve(instance, name)?;
        let results = instance.call(&function, &[a.to_flat()])?;
        let slot = results
            .first()
            .copied()
            .ok_or_else(|| AbiError::internal("fast path `(T) -> R` got no result slots"))?;
        Ok(R::from_flat(slot))
    }

    /// Fast path for `(T, U) -> R` handlers.
    pub fn call_fast2<T: FastScalar, U: FastScalar, R: FastScalar>(
        &self,
        instance: &mut Instance,
        name: &str,
        a: T,
        b: U,
    ) -> AbiResult<R> {
        let function = self.resolve(instance, name)?;
        let results = instance.call(&function, &[a.to_flat(), b.to_flat()])?;
        let slot = results
            .first()
            .copied()
            .ok_or_else(|| AbiError::internal("fast path `(T, U) -> R` got no result slots"))?;
        Ok(R::from_flat(slot))
    }
}

fn read_flat_string<Instance>(memory: &Memory<'_, Instance>, ptr: u32, len: u32) -> AbiResult<String>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let bytes = memory.read(GuestPointer(ptr), len)?;
    String::from_utf8(bytes).map_err(|_| AbiError::invalid("string result is not valid UTF-8"))
}

fn read_flat_string_result<Instance>(memory: &Memory<'_, Instance>, ptr_addr: u32, len_addr: u32) -> AbiResult<String>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let out_ptr = u32::from_le_bytes(memory.read(GuestPointer(ptr_addr), 4)?.try_into().unwrap());
    let out_len = u32::from_le_bytes(memory.read(GuestPointer(len_addr), 4)?.try_into().unwrap());
    read_flat_string(memory, out_ptr, out_len)
}

/// Reconstructs a result directly from one bulk read of `bytes`, for
/// shapes [`crate::compiler::CompiledPlan::is_word_reconstructible`]
/// accepts — primitives and records/tuples of only such — skipping the
/// recursive per-field guest-memory reads `load_value` would otherwise
/// issue (spec.md §9 Open Question resolution, see `DESIGN.md`).
fn decode_word_reconstructed(ty: &WitTypeDef, bytes: &[u8]) -> AbiResult<Value> {
    fn read(ty: &WitTypeDef, bytes: &[u8], offset: u32) -> AbiResult<(Value, u32)> {
        use WitTypeDef::*;
        let at = offset as usize;
        Ok(match ty {
            Bool => (Value::Bool(bytes[at] != 0), offset + 1),
            U8 => (Value::U8(bytes[at]), offset + 1),
            S8 => (Value::S8(bytes[at] as i8), offset + 1),
            U16 => (Value::U16(u16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())), offset + 2),
            S16 => (Value::S16(i16::from_le_bytes(bytes[at..at + 2].try_into().unwrap())), offset + 2),
            U32 => (Value::U32(u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())), offset + 4),
            S32 => (Value::S32(i32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())), offset + 4),
            U64 => (Value::U64(u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())), offset + 8),
            S64 => (Value::S64(i64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())), offset + 8),
            F32 => (Value::F32(f32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())), offset + 4),
            F64 => (Value::F64(f64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())), offset + 8),
            Char => {
                let scalar = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
                let c = char::from_u32(scalar)
                    .ok_or_else(|| AbiError::invalid("result is not a valid Unicode scalar value"))?;
                (Value::Char(c), offset + 4)
            }
            Resource => (Value::Resource(u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())), offset + 4),
            Enum(cases) => {
                let discriminant = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
                if discriminant as usize >= cases.len() {
                    return Err(AbiError::invalid(format!("enum discriminant {discriminant} out of range")));
                }
                (Value::Enum(discriminant), offset + 4)
            }
            Record(fields) => {
                let mut cursor = offset;
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    let field_layout = layout(&field.ty);
                    cursor = align_up(cursor, field_layout.alignment.max(1));
                    let (value, next) = read(&field.ty, bytes, cursor)?;
                    values.push(value);
                    cursor = next;
                }
                (Value::Record(values), cursor)
            }
            Tuple(elements) => {
                let mut cursor = offset;
                let mut values = Vec::with_capacity(elements.len());
                for element_ty in elements {
                    let element_layout = layout(element_ty);
                    cursor = align_up(cursor, element_layout.alignment.max(1));
                    let (value, next) = read(element_ty, bytes, cursor)?;
                    values.push(value);
                    cursor = next;
                }
                (Value::Tuple(values), cursor)
            }
            String | List(_) | Variant(_) | Flags(_) | Option(_) | Result { .. } => {
                return Err(AbiError::internal(
                    "word-reconstruction attempted on a non-reconstructible result shape",
                ))
            }
        })
    }
    Ok(read(ty, bytes, 0)?.0)
}

/// `Results::wit_type_def()` is a single WIT shape; when it's a `Tuple`
/// (the convention this crate uses for multi-value returns, see
/// `DESIGN.md`) its elements are the individually flattened result types,
/// otherwise it is itself the sole result type.
fn flatten_top_level(ty: &WitTypeDef) -> Vec<WitTypeDef> {
    match ty {
        WitTypeDef::Tuple(elements) => elements.clone(),
        other => vec![other.clone()],
    }
}

fn decode_top_level<Instance>(
    ty: &WitTypeDef,
    slots: &[FlatValue],
    memory: &Memory<'_, Instance>,
) -> AbiResult<Value>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    match ty {
        WitTypeDef::Tuple(elements) => {
            let values = decode_results(elements, slots, memory)?;
            Ok(Value::Tuple(values))
        }
        other => {
            let values = decode_results(std::slice::from_ref(other), slots, memory)?;
            Ok(values.into_iter().next().expect("decode_results returns one value per type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flatten_top_level_splits_tuples_but_not_scalars() {
        let scalar = flatten_top_level(&WitTypeDef::U32);
        assert_eq!(scalar, vec![WitTypeDef::U32]);

        let tuple = flatten_top_level(&WitTypeDef::Tuple(vec![WitTypeDef::U32, WitTypeDef::Bool]));
        assert_eq!(tuple, vec![WitTypeDef::U32, WitTypeDef::Bool]);
    }
}
