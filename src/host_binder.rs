//! Wraps native Rust closures as flat-ABI guest-callable host functions
//! (spec.md §4.H). Grounded on the manual, bounds-checked guest-memory
//! helpers in `los-vm/src/host.rs` and `uika-wasm-host/src/wasm_host.rs`
//! (see `DESIGN.md`) rather than the `Memory`/`AllocList` façade the
//! dispatcher uses for guest-initiated calls — the two call directions
//! get memory access through different collaborators (`Instance` vs.
//! `RawGuestMemory`), so they earn their own small lift/lower helpers.

use tracing::trace;

use crate::engine::{GuestPointer, RawGuestMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::{FlatType, FlatValue};
use crate::flatten::flat_count;
use crate::layout::{align_up, layout};
use crate::native::WitType;
use crate::value::Value;
use crate::wit_type::WitTypeDef;

/// How many leading flat slots a handler's first parameter consumes
/// before the guest-declared parameters start — used when a handler
/// takes a "call context" argument that is not part of the WIT signature
/// (spec.md §4.H step 2).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContextArity(pub usize);

/// Pre-computed shape of a host function binding: how many leading flat
/// slots belong to a call-context argument, and the flat parameter/result
/// slot types the engine must declare for the import (spec.md §4.H step 2).
pub struct LowerWrapper {
    pub context_arity: ContextArity,
    pub param_flat_types: Vec<FlatType>,
    pub result_flat_types: Vec<FlatType>,
}

impl LowerWrapper {
    pub fn new<Params: WitType, Results: WitType>(context_arity: ContextArity) -> Self {
        LowerWrapper {
            context_arity,
            param_flat_types: crate::flatten::flat_type_list(&Params::wit_type_def()),
            result_flat_types: crate::flatten::flat_type_list(&Results::wit_type_def()),
        }
    }
}

/// Builds the general-path closure for a host function: lift every
/// parameter from the flat stack (and guest memory, for out-of-line
/// data), invoke `handler`, then lower its result back (spec.md §4.H
/// step 4). `handler` is called with the WIT-declared parameters only —
/// any leading call-context slots are stripped before lifting begins.
pub fn bind_general<Params, Results, F>(
    context_arity: ContextArity,
    handler: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    Params: WitType + Send + Sync + 'static,
    Results: WitType + Send + Sync + 'static,
    F: Fn(Params) -> AbiResult<Results> + Send + Sync + 'static,
{
    move |memory, slots| {
        trace!(skip = context_arity.0, "binding general host-function path");
        let param_slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let param_ty = Params::wit_type_def();
        let (value, _) = lift_value(&param_ty, param_slots, memory)?;
        let params = Params::from_value(value)?;
        let results = handler(params)?;
        lower_value_to_flat(&Results::wit_type_def(), &results.to_value(), memory)
    }
}

/// `[resource-drop]R` imports: a raw `(handle: u32) -> ()` wrapper around
/// a drop callback, bypassing the general lift/lower path entirely since
/// neither side has a meaningful WIT shape beyond the bare handle
/// (spec.md §6 resource-drop naming; §4.H "raw wrapper").
pub fn bind_resource_drop<F>(
    drop_fn: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(u32) -> AbiResult<()> + Send + Sync + 'static,
{
    move |_memory, slots| {
        let handle = slots
            .first()
            .ok_or_else(|| AbiError::invalid("resource-drop called with no handle argument"))?
            .as_u32();
        drop_fn(handle)?;
        Ok(Vec::new())
    }
}

/// Fast path for `(string) -> ()` handlers (e.g. a `log` import), skipping
/// the general lift machinery for the single most common host-import
/// shape (spec.md §4.H step 3).
pub fn bind_string_to_unit<F>(
    context_arity: ContextArity,
    f: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(&str) -> AbiResult<()> + Send + Sync + 'static,
{
    move |memory, slots| {
        let slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let s = read_flat_string(slots, memory)?;
        f(&s)?;
        Ok(Vec::new())
    }
}

/// Fast path for `(string, string) -> string` handlers (e.g. a `concat`
/// import).
pub fn bind_string_string_to_string<F>(
    context_arity: ContextArity,
    f: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(&str, &str) -> AbiResult<String> + Send + Sync + 'static,
{
    move |memory, slots| {
        let slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let first = slots
            .get(0..2)
            .ok_or_else(|| AbiError::invalid("expected two string arguments (ptr, len) x 2"))?;
        let second = slots
            .get(2..4)
            .ok_or_else(|| AbiError::invalid("expected two string arguments (ptr, len) x 2"))?;
        let a = read_flat_string(first, memory)?;
        let b = read_flat_string(second, memory)?;
        let result = f(&a, &b)?;
        let (ptr, len) = write_bytes(result.as_bytes(), 1, memory)?;
        Ok(vec![FlatValue::I32(ptr.0), FlatValue::I32(len)])
    }
}

/// Fast path for variable-arity `u32` arithmetic imports, `(u32...) ->
/// u32`.
pub fn bind_u32_fold_to_u32<F>(
    context_arity: ContextArity,
    f: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(&[u32]) -> AbiResult<u32> + Send + Sync + 'static,
{
    move |_memory, slots| {
        let slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let values: Vec<u32> = slots.iter().map(FlatValue::as_u32).collect();
        Ok(vec![FlatValue::I32(f(&values)?)])
    }
}

/// Fast path for `(u32) -> bool` predicate imports.
pub fn bind_u32_to_bool<F>(
    context_arity: ContextArity,
    f: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(u32) -> AbiResult<bool> + Send + Sync + 'static,
{
    move |_memory, slots| {
        let slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let value = slots
            .first()
            .ok_or_else(|| AbiError::invalid("expected one u32 argument"))?
            .as_u32();
        Ok(vec![FlatValue::I32(f(value)? as u32)])
    }
}

/// Fast path for `(u32, u32) -> bool` predicate imports.
pub fn bind_u32_u32_to_bool<F>(
    context_arity: ContextArity,
    f: F,
) -> impl Fn(&mut dyn RawGuestMemory, &[FlatValue]) -> AbiResult<Vec<FlatValue>> + Send + Sync + 'static
where
    F: Fn(u32, u32) -> AbiResult<bool> + Send + Sync + 'static,
{
    move |_memory, slots| {
        let slots = slots.get(context_arity.0..).ok_or_else(|| {
            AbiError::invalid("fewer flat slots than the declared call-context arity")
        })?;
        let a = slots
            .first()
            .ok_or_else(|| AbiError::invalid("expected two u32 arguments"))?
            .as_u32();
        let b = slots
            .get(1)
            .ok_or_else(|| AbiError::invalid("expected two u32 arguments"))?
            .as_u32();
        Ok(vec![FlatValue::I32(f(a, b)? as u32)])
    }
}

fn read_flat_string(slots: &[FlatValue], memory: &mut dyn RawGuestMemory) -> AbiResult<String> {
    let ptr = GuestPointer(
        slots
            .first()
            .ok_or_else(|| AbiError::invalid("string argument missing its pointer slot"))?
            .as_u32(),
    );
    let len = slots
        .get(1)
        .ok_or_else(|| AbiError::invalid("string argument missing its length slot"))?
        .as_u32();
    let bytes = memory.read(ptr, len)?;
    String::from_utf8(bytes).map_err(|_| AbiError::invalid("string argument is not valid UTF-8"))
}

fn write_bytes(bytes: &[u8], align: u32, memory: &mut dyn RawGuestMemory) -> AbiResult<(GuestPointer, u32)> {
    let ptr = memory.alloc(bytes.len().max(1) as u32, align)?;
    if !bytes.is_empty() {
        memory.write(ptr, bytes)?;
    }
    Ok((ptr, bytes.len() as u32))
}

/// Lifts a value of shape `ty` from the front of `slots`, reading any
/// out-of-line data (strings, lists) from `memory`. Mirrors
/// [`crate::decode::lift_from_stack`] but against [`RawGuestMemory`]
/// instead of the dispatcher's `Memory<Instance>` façade — see the module
/// doc comment for why the two call directions don't share one helper.
fn lift_value(
    ty: &WitTypeDef,
    slots: &[FlatValue],
    memory: &mut dyn RawGuestMemory,
) -> AbiResult<(Value, usize)> {
    use WitTypeDef::*;
    let first = || {
        slots
            .first()
            .copied()
            .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting a host-call argument"))
    };
    let value = match ty {
        Bool => Value::Bool(first()?.as_u32() != 0),
        U8 => Value::U8(first()?.as_u32() as u8),
        S8 => Value::S8(first()?.as_i32() as i8),
        U16 => Value::U16(first()?.as_u32() as u16),
        S16 => Value::S16(first()?.as_i32() as i16),
        U32 => Value::U32(first()?.as_u32()),
        S32 => Value::S32(first()?.as_i32()),
        U64 => Value::U64(first()?.as_u64()),
        S64 => Value::S64(first()?.as_i64()),
        F32 => Value::F32(first()?.as_f32()),
        F64 => Value::F64(first()?.as_f64()),
        Char => Value::Char(
            char::from_u32(first()?.as_u32())
                .ok_or_else(|| AbiError::invalid("argument is not a valid Unicode scalar value"))?,
        ),
        Resource => Value::Resource(first()?.as_u32()),
        String => return Ok((Value::String(read_flat_string(slots, memory)?), 2)),
        List(element_ty) => {
            let ptr = GuestPointer(first()?.as_u32());
            let len = slots
                .get(1)
                .ok_or_else(|| AbiError::invalid("list argument missing its length slot"))?
                .as_u32();
            let element_layout = layout(element_ty);
            let stride = align_up(element_layout.size, element_layout.alignment);
            let mut elements = Vec::with_capacity(len as usize);
            for i in 0..len {
                elements.push(load_from_memory(element_ty, ptr.advance(i * stride), memory)?);
            }
            return Ok((Value::List(elements), 2));
        }
        Record(fields) => {
            let mut cursor = 0usize;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let count = flat_count(&field.ty);
                let slice = slots.get(cursor..cursor + count).ok_or_else(|| {
                    AbiError::invalid("flat stack exhausted while lifting a record field")
                })?;
                values.push(lift_value(&field.ty, slice, memory)?.0);
                cursor += count;
            }
            return Ok((Value::Record(values), cursor));
        }
        Tuple(element_tys) => {
            let mut cursor = 0usize;
            let mut values = Vec::with_capacity(element_tys.len());
            for element_ty in element_tys {
                let count = flat_count(element_ty);
                let slice = slots.get(cursor..cursor + count).ok_or_else(|| {
                    AbiError::invalid("flat stack exhausted while lifting a tuple element")
                })?;
                values.push(lift_value(element_ty, slice, memory)?.0);
                cursor += count;
            }
            return Ok((Value::Tuple(values), cursor));
        }
        Enum(cases) => {
            let discriminant = first()?.as_u32();
            if discriminant as usize >= cases.len() {
                return Err(AbiError::invalid(format!(
                    "enum discriminant {discriminant} out of range"
                )));
            }
            Value::Enum(discriminant)
        }
        Flags(flags) => {
            let word_count = crate::layout::flags_word_count(flags.len()) as usize;
            let words = slots
                .get(..word_count)
                .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting flags"))?
                .iter()
                .map(FlatValue::as_u32)
                .collect();
            return Ok((Value::Flags(words), word_count));
        }
        Variant(cases) => {
            let discriminant = first()?.as_u32();
            let case = cases.get(discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let width = cases
                .iter()
                .map(|c| c.payload.as_ref().map(flat_count).unwrap_or(0))
                .max()
                .unwrap_or(0);
            let payload_slots = slots
                .get(1..1 + width)
                .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting a variant"))?;
            let payload = match &case.payload {
                Some(payload_ty) => {
                    let used = flat_count(payload_ty);
                    Some(Box::new(lift_value(payload_ty, &payload_slots[..used], memory)?.0))
                }
                None => None,
            };
            return Ok((Value::Variant(discriminant, payload), 1 + width));
        }
        Option(inner_ty) => {
            let discriminant = first()?.as_u32();
            let width = flat_count(inner_ty);
            let payload_slots = slots
                .get(1..1 + width)
                .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting an option"))?;
            let payload = if discriminant != 0 {
                Some(Box::new(lift_value(inner_ty, payload_slots, memory)?.0))
            } else {
                None
            };
            return Ok((Value::Option(payload), 1 + width));
        }
        Result { ok, err } => {
            let discriminant = first()?.as_u32();
            let ok_width = ok.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            let err_width = err.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            let width = ok_width.max(err_width);
            let payload_slots = slots
                .get(1..1 + width)
                .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting a result"))?;
            let result = match discriminant {
                0 => Ok(match ok {
                    Some(ok_ty) => {
                        let used = flat_count(ok_ty);
                        Some(Box::new(lift_value(ok_ty, &payload_slots[..used], memory)?.0))
                    }
                    None => None,
                }),
                1 => Err(match err {
                    Some(err_ty) => {
                        let used = flat_count(err_ty);
                        Some(Box::new(lift_value(err_ty, &payload_slots[..used], memory)?.0))
                    }
                    None => None,
                }),
                other => {
                    return Err(AbiError::invalid(format!(
                        "result discriminant must be 0 or 1, found {other}"
                    )))
                }
            };
            return Ok((Value::Result(result), 1 + width));
        }
    };
    Ok((value, flat_count(ty)))
}

fn load_from_memory(ty: &WitTypeDef, addr: GuestPointer, memory: &mut dyn RawGuestMemory) -> AbiResult<Value> {
    use WitTypeDef::*;
    Ok(match ty {
        Bool => Value::Bool(memory.read(addr, 1)?[0] != 0),
        U8 => Value::U8(memory.read(addr, 1)?[0]),
        S8 => Value::S8(memory.read(addr, 1)?[0] as i8),
        U16 => Value::U16(u16::from_le_bytes(memory.read(addr, 2)?.try_into().unwrap())),
        S16 => Value::S16(i16::from_le_bytes(memory.read(addr, 2)?.try_into().unwrap())),
        U32 => Value::U32(u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap())),
        S32 => Value::S32(i32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap())),
        U64 => Value::U64(u64::from_le_bytes(memory.read(addr, 8)?.try_into().unwrap())),
        S64 => Value::S64(i64::from_le_bytes(memory.read(addr, 8)?.try_into().unwrap())),
        F32 => Value::F32(f32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap())),
        F64 => Value::F64(f64::from_le_bytes(memory.read(addr, 8)?.try_into().unwrap())),
        Char => {
            let scalar = u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap());
            Value::Char(
                char::from_u32(scalar)
                    .ok_or_else(|| AbiError::invalid("list element is not a valid Unicode scalar value"))?,
            )
        }
        Resource => Value::Resource(u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap())),
        String => {
            let ptr = GuestPointer(u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap()));
            let len = u32::from_le_bytes(memory.read(addr.advance(4), 4)?.try_into().unwrap());
            let bytes = memory.read(ptr, len)?;
            Value::String(String::from_utf8(bytes).map_err(|_| AbiError::invalid("string is not valid UTF-8"))?)
        }
        List(element_ty) => {
            let ptr = GuestPointer(u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap()));
            let len = u32::from_le_bytes(memory.read(addr.advance(4), 4)?.try_into().unwrap());
            let element_layout = layout(element_ty);
            let stride = align_up(element_layout.size, element_layout.alignment);
            let mut elements = Vec::with_capacity(len as usize);
            for i in 0..len {
                elements.push(load_from_memory(element_ty, ptr.advance(i * stride), memory)?);
            }
            Value::List(elements)
        }
        Record(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            let mut offset = 0u32;
            for field in fields {
                let field_layout = layout(&field.ty);
                offset = align_up(offset, field_layout.alignment);
                values.push(load_from_memory(&field.ty, addr.advance(offset), memory)?);
                offset += field_layout.size;
            }
            Value::Record(values)
        }
        Tuple(element_tys) => {
            let mut values = Vec::with_capacity(element_tys.len());
            let mut offset = 0u32;
            for element_ty in element_tys {
                let element_layout = layout(element_ty);
                offset = align_up(offset, element_layout.alignment);
                values.push(load_from_memory(element_ty, addr.advance(offset), memory)?);
                offset += element_layout.size;
            }
            Value::Tuple(values)
        }
        Enum(cases) => {
            let discriminant = u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap());
            if discriminant as usize >= cases.len() {
                return Err(AbiError::invalid(format!(
                    "enum discriminant {discriminant} out of range"
                )));
            }
            Value::Enum(discriminant)
        }
        Flags(flags) => {
            let word_count = crate::layout::flags_word_count(flags.len());
            let mut words = Vec::with_capacity(word_count as usize);
            for i in 0..word_count {
                words.push(u32::from_le_bytes(
                    memory.read(addr.advance(i * 4), 4)?.try_into().unwrap(),
                ));
            }
            Value::Flags(words)
        }
        Variant(cases) => {
            let variant_layout = layout(ty);
            let discriminant = u32::from_le_bytes(memory.read(addr, 4)?.try_into().unwrap());
            let case = cases.get(discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let payload = match &case.payload {
                Some(payload_ty) => Some(Box::new(load_from_memory(
                    payload_ty,
                    addr.advance(variant_layout.field_offsets[1]),
                    memory,
                )?)),
                None => None,
            };
            Value::Variant(discriminant, payload)
        }
        Option(inner_ty) => {
            let option_layout = layout(ty);
            let discriminant = memory.read(addr, 1)?[0];
            let payload = if discriminant != 0 {
                Some(Box::new(load_from_memory(
                    inner_ty,
                    addr.advance(option_layout.field_offsets[1]),
                    memory,
                )?))
            } else {
                None
            };
            Value::Option(payload)
        }
        Result { ok, err } => {
            let result_layout = layout(ty);
            let discriminant = memory.read(addr, 1)?[0];
            let payload_addr = addr.advance(result_layout.field_offsets[1]);
            match discriminant {
                0 => Value::Result(Ok(match ok {
                    Some(ok_ty) => Some(Box::new(load_from_memory(ok_ty, payload_addr, memory)?)),
                    None => None,
                })),
                1 => Value::Result(Err(match err {
                    Some(err_ty) => Some(Box::new(load_from_memory(err_ty, payload_addr, memory)?)),
                    None => None,
                })),
                other => {
                    return Err(AbiError::invalid(format!(
                        "result discriminant must be 0 or 1, found {other}"
                    )))
                }
            }
        }
    })
}

/// Lowers `value` (of shape `ty`) onto a flat result stack, allocating in
/// guest memory for any out-of-line data. Mirrors
/// [`crate::encode::lower_to_stack`] against [`RawGuestMemory`]; see the
/// module doc comment for why host-function results don't share the
/// dispatcher's `AllocList` bookkeeping — a host function's allocations
/// always succeed or the whole call traps, so there's no partial state to
/// unwind.
fn lower_value_to_flat(
    ty: &WitTypeDef,
    value: &Value,
    memory: &mut dyn RawGuestMemory,
) -> AbiResult<Vec<FlatValue>> {
    use WitTypeDef::*;
    let slots = match (ty, value) {
        (Bool, Value::Bool(b)) => vec![FlatValue::I32(*b as u32)],
        (U8, Value::U8(v)) => vec![FlatValue::I32(*v as u32)],
        (S8, Value::S8(v)) => vec![FlatValue::I32(*v as i32 as u32)],
        (U16, Value::U16(v)) => vec![FlatValue::I32(*v as u32)],
        (S16, Value::S16(v)) => vec![FlatValue::I32(*v as i32 as u32)],
        (U32, Value::U32(v)) => vec![FlatValue::I32(*v)],
        (S32, Value::S32(v)) => vec![FlatValue::I32(*v as u32)],
        (U64, Value::U64(v)) => vec![FlatValue::I64(*v)],
        (S64, Value::S64(v)) => vec![FlatValue::I64(*v as u64)],
        (F32, Value::F32(v)) => vec![FlatValue::F32(*v)],
        (F64, Value::F64(v)) => vec![FlatValue::F64(*v)],
        (Char, Value::Char(c)) => vec![FlatValue::I32(*c as u32)],
        (Resource, Value::Resource(handle)) => vec![FlatValue::I32(*handle)],
        (String, Value::String(s)) => {
            let (ptr, len) = write_bytes(s.as_bytes(), 1, memory)?;
            vec![FlatValue::I32(ptr.0), FlatValue::I32(len)]
        }
        (List(element_ty), Value::List(elements)) => {
            let element_layout = layout(element_ty);
            let stride = align_up(element_layout.size, element_layout.alignment);
            let ptr = memory.alloc((stride * elements.len() as u32).max(1), element_layout.alignment.max(1))?;
            for (i, element) in elements.iter().enumerate() {
                store_into_memory(element_ty, element, ptr.advance((i as u32) * stride), memory)?;
            }
            vec![FlatValue::I32(ptr.0), FlatValue::I32(elements.len() as u32)]
        }
        (Record(fields), Value::Record(values)) => {
            let mut slots = Vec::new();
            for (field, value) in fields.iter().zip(values) {
                slots.append(&mut lower_value_to_flat(&field.ty, value, memory)?);
            }
            slots
        }
        (Tuple(element_tys), Value::Tuple(values)) => {
            let mut slots = Vec::new();
            for (ty, value) in element_tys.iter().zip(values) {
                slots.append(&mut lower_value_to_flat(ty, value, memory)?);
            }
            slots
        }
        (Enum(_), Value::Enum(discriminant)) => vec![FlatValue::I32(*discriminant)],
        (Flags(_), Value::Flags(words)) => words.iter().map(|w| FlatValue::I32(*w)).collect(),
        (Variant(cases), Value::Variant(discriminant, payload)) => {
            let case = cases.get(*discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let width = cases
                .iter()
                .map(|c| c.payload.as_ref().map(crate::flatten::flat_type_list).map(|l| l.len()).unwrap_or(0))
                .max()
                .unwrap_or(0);
            let mut payload_slots = match (&case.payload, payload) {
                (Some(payload_ty), Some(inner)) => lower_value_to_flat(payload_ty, inner, memory)?,
                (None, None) => Vec::new(),
                _ => return Err(AbiError::invalid("variant case/payload mismatch")),
            };
            payload_slots.resize(width, FlatValue::I32(0));
            let mut slots = vec![FlatValue::I32(*discriminant)];
            slots.extend(payload_slots);
            slots
        }
        (Option(inner_ty), Value::Option(payload)) => {
            let width = crate::flatten::flat_type_list(inner_ty).len();
            let mut slots = vec![FlatValue::I32(payload.is_some() as u32)];
            let mut payload_slots = match payload {
                Some(inner) => lower_value_to_flat(inner_ty, inner, memory)?,
                None => Vec::new(),
            };
            payload_slots.resize(width, FlatValue::I32(0));
            slots.extend(payload_slots);
            slots
        }
        (Result { ok, err }, Value::Result(result)) => {
            let ok_width = ok.as_ref().map(|t| crate::flatten::flat_type_list(t).len()).unwrap_or(0);
            let err_width = err.as_ref().map(|t| crate::flatten::flat_type_list(t).len()).unwrap_or(0);
            let width = ok_width.max(err_width);
            let (discriminant, mut payload_slots) = match result {
                Ok(payload) => (
                    0u32,
                    match (ok, payload) {
                        (Some(ty), Some(inner)) => lower_value_to_flat(ty, inner, memory)?,
                        (None, None) => Vec::new(),
                        _ => return Err(AbiError::invalid("result ok arm/payload mismatch")),
                    },
                ),
                Err(payload) => (
                    1u32,
                    match (err, payload) {
                        (Some(ty), Some(inner)) => lower_value_to_flat(ty, inner, memory)?,
                        (None, None) => Vec::new(),
                        _ => return Err(AbiError::invalid("result err arm/payload mismatch")),
                    },
                ),
            };
            payload_slots.resize(width, FlatValue::I32(0));
            let mut slots = vec![FlatValue::I32(discriminant)];
            slots.extend(payload_slots);
            slots
        }
        (expected, found) => {
            return Err(AbiError::invalid(format!(
                "cannot lower a `{}` value as `{expected:?}`",
                found.shape_name()
            )))
        }
    };
    Ok(slots)
}

fn store_into_memory(
    ty: &WitTypeDef,
    value: &Value,
    addr: GuestPointer,
    memory: &mut dyn RawGuestMemory,
) -> AbiResult<()> {
    use WitTypeDef::*;
    match (ty, value) {
        (Bool, Value::Bool(b)) => memory.write(addr, &[*b as u8]),
        (U8, Value::U8(v)) => memory.write(addr, &[*v]),
        (S8, Value::S8(v)) => memory.write(addr, &(*v as u8).to_le_bytes()),
        (U16, Value::U16(v)) => memory.write(addr, &v.to_le_bytes()),
        (S16, Value::S16(v)) => memory.write(addr, &v.to_le_bytes()),
        (U32, Value::U32(v)) => memory.write(addr, &v.to_le_bytes()),
        (S32, Value::S32(v)) => memory.write(addr, &v.to_le_bytes()),
        (U64, Value::U64(v)) => memory.write(addr, &v.to_le_bytes()),
        (S64, Value::S64(v)) => memory.write(addr, &v.to_le_bytes()),
        (F32, Value::F32(v)) => memory.write(addr, &v.to_le_bytes()),
        (F64, Value::F64(v)) => memory.write(addr, &v.to_le_bytes()),
        (Char, Value::Char(c)) => memory.write(addr, &(*c as u32).to_le_bytes()),
        (Resource, Value::Resource(handle)) => memory.write(addr, &handle.to_le_bytes()),
        (String, Value::String(s)) => {
            let (ptr, len) = write_bytes(s.as_bytes(), 1, memory)?;
            memory.write(addr, &ptr.0.to_le_bytes())?;
            memory.write(addr.advance(4), &len.to_le_bytes())
        }
        (List(element_ty), Value::List(elements)) => {
            let element_layout = layout(element_ty);
            let stride = align_up(element_layout.size, element_layout.alignment);
            let ptr = memory.alloc((stride * elements.len() as u32).max(1), element_layout.alignment.max(1))?;
            for (i, element) in elements.iter().enumerate() {
                store_into_memory(element_ty, element, ptr.advance((i as u32) * stride), memory)?;
            }
            memory.write(addr, &ptr.0.to_le_bytes())?;
            memory.write(addr.advance(4), &(elements.len() as u32).to_le_bytes())
        }
        (Record(fields), Value::Record(values)) => {
            let mut offset = 0u32;
            for (field, value) in fields.iter().zip(values) {
                let field_layout = layout(&field.ty);
                offset = align_up(offset, field_layout.alignment);
                store_into_memory(&field.ty, value, addr.advance(offset), memory)?;
                offset += field_layout.size;
            }
            Ok(())
        }
        (Tuple(element_tys), Value::Tuple(values)) => {
            let mut offset = 0u32;
            for (ty, value) in element_tys.iter().zip(values) {
                let element_layout = layout(ty);
                offset = align_up(offset, element_layout.alignment);
                store_into_memory(ty, value, addr.advance(offset), memory)?;
                offset += element_layout.size;
            }
            Ok(())
        }
        (Enum(_), Value::Enum(discriminant)) => memory.write(addr, &discriminant.to_le_bytes()),
        (Flags(_), Value::Flags(words)) => {
            for (i, word) in words.iter().enumerate() {
                memory.write(addr.advance((i as u32) * 4), &word.to_le_bytes())?;
            }
            Ok(())
        }
        (Variant(cases), Value::Variant(discriminant, payload)) => {
            let case = cases.get(*discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let variant_layout = layout(ty);
            memory.write(addr, &discriminant.to_le_bytes())?;
            if let Some(payload_ty) = &case.payload {
                let inner = payload
                    .as_ref()
                    .ok_or_else(|| AbiError::invalid("variant case expects a payload"))?;
                store_into_memory(payload_ty, inner, addr.advance(variant_layout.field_offsets[1]), memory)?;
            }
            Ok(())
        }
        (Option(inner_ty), Value::Option(payload)) => {
            let option_layout = layout(ty);
            match payload {
                Some(inner) => {
                    memory.write(addr, &1u8.to_le_bytes())?;
                    store_into_memory(inner_ty, inner, addr.advance(option_layout.field_offsets[1]), memory)
                }
                None => memory.write(addr, &0u8.to_le_bytes()),
            }
        }
        (Result { ok, err }, Value::Result(result)) => {
            let result_layout = layout(ty);
            match result {
                Ok(payload) => {
                    memory.write(addr, &0u8.to_le_bytes())?;
                    if let (Some(ok_ty), Some(inner)) = (ok, payload) {
                        store_into_memory(ok_ty, inner, addr.advance(result_layout.field_offsets[1]), memory)?;
                    }
                    Ok(())
                }
                Err(payload) => {
                    memory.write(addr, &1u8.to_le_bytes())?;
                    if let (Some(err_ty), Some(inner)) = (err, payload) {
                        store_into_memory(err_ty, inner, addr.advance(result_layout.field_offsets[1]), memory)?;
                    }
                    Ok(())
                }
            }
        }
        (expected, found) => Err(AbiError::invalid(format!(
            "cannot store a `{}` value as `{expected:?}`",
            found.shape_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// A tiny in-memory [`RawGuestMemory`] with a bump-pointer allocator,
    /// just enough to exercise the lift/lower paths above without pulling
    /// in the full `testutil::FakeInstance` harness.
    struct ScratchMemory {
        bytes: Mutex<Vec<u8>>,
    }

    impl ScratchMemory {
        fn new(size: usize) -> Self {
            ScratchMemory {
                bytes: Mutex::new(vec![0u8; size]),
            }
        }
    }

    impl RawGuestMemory for ScratchMemory {
        fn read(&self, location: GuestPointer, length: u32) -> AbiResult<Vec<u8>> {
            let bytes = self.bytes.lock().unwrap();
            let start = location.0 as usize;
            let end = start + length as usize;
            bytes
                .get(start..end)
                .map(|s| s.to_vec())
                .ok_or_else(|| AbiError::invalid("out of bounds read"))
        }

        fn write(&mut self, location: GuestPointer, data: &[u8]) -> AbiResult<()> {
            let mut bytes = self.bytes.lock().unwrap();
            let start = location.0 as usize;
            bytes
                .get_mut(start..start + data.len())
                .ok_or_else(|| AbiError::invalid("out of bounds write"))?
                .copy_from_slice(data);
            Ok(())
        }

        fn alloc(&mut self, size: u32, _align: u32) -> AbiResult<GuestPointer> {
            let mut bytes = self.bytes.lock().unwrap();
            let ptr = bytes.len() as u32;
            bytes.extend(std::iter::repeat(0u8).take(size as usize));
            Ok(GuestPointer(ptr))
        }

        fn free(&mut self, _ptr: GuestPointer, _size: u32, _align: u32) -> AbiResult<()> {
            Ok(())
        }
    }

    #[test]
    fn bind_string_to_unit_reads_the_guest_string() {
        let mut memory = ScratchMemory::new(64);
        memory.bytes.get_mut().unwrap()[0..5].copy_from_slice(b"hello");
        let seen = Mutex::new(String::new());
        let closure = bind_string_to_unit(ContextArity(0), |s| {
            *seen.lock().unwrap() = s.to_string();
            Ok(())
        });
        closure(&mut memory, &[FlatValue::I32(0), FlatValue::I32(5)]).unwrap();
        assert_eq!(*seen.lock().unwrap(), "hello");
    }

    #[test]
    fn bind_string_string_to_string_allocates_the_result() {
        let mut memory = ScratchMemory::new(64);
        memory.bytes.get_mut().unwrap()[0..2].copy_from_slice(b"ab");
        memory.bytes.get_mut().unwrap()[2..4].copy_from_slice(b"cd");
        let closure = bind_string_string_to_string(ContextArity(0), |a, b| Ok(format!("{a}{b}")));
        let results = closure(
            &mut memory,
            &[
                FlatValue::I32(0),
                FlatValue::I32(2),
                FlatValue::I32(2),
                FlatValue::I32(2),
            ],
        )
        .unwrap();
        let ptr = results[0].as_u32();
        let len = results[1].as_u32();
        let bytes = memory.read(GuestPointer(ptr), len).unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "abcd");
    }

    #[test]
    fn bind_u32_fold_to_u32_sums_every_argument() {
        let mut memory = ScratchMemory::new(8);
        let closure = bind_u32_fold_to_u32(ContextArity(0), |values| Ok(values.iter().sum()));
        let results = closure(&mut memory, &[FlatValue::I32(2), FlatValue::I32(3), FlatValue::I32(4)]).unwrap();
        assert_eq!(results[0].as_u32(), 9);
    }

    #[test]
    fn bind_u32_to_bool_skips_the_leading_context_slot() {
        let mut memory = ScratchMemory::new(8);
        let closure = bind_u32_to_bool(ContextArity(1), |v| Ok(v % 2 == 0));
        let results = closure(&mut memory, &[FlatValue::I32(999), FlatValue::I32(4)]).unwrap();
        assert_eq!(results[0].as_u32(), 1);
    }

    #[test]
    fn bind_resource_drop_passes_the_bare_handle() {
        let mut memory = ScratchMemory::new(8);
        let dropped = Mutex::new(None);
        let closure = bind_resource_drop(|handle| {
            *dropped.lock().unwrap() = Some(handle);
            Ok(())
        });
        closure(&mut memory, &[FlatValue::I32(42)]).unwrap();
        assert_eq!(*dropped.lock().unwrap(), Some(42));
    }

    #[test]
    fn general_path_round_trips_a_record_with_a_string_field() {
        #[derive(Debug, PartialEq)]
        struct Greeting {
            name: String,
            times: u32,
        }
        crate::wit_record!(Greeting { name: String, times: u32 });

        let mut memory = ScratchMemory::new(64);
        memory.bytes.get_mut().unwrap()[0..4].copy_from_slice(b"Ada\0");
        let closure = bind_general::<Greeting, u32, _>(ContextArity(0), |greeting| {
            Ok(greeting.name.len() as u32 * greeting.times)
        });
        let slots = [FlatValue::I32(0), FlatValue::I32(3), FlatValue::I32(2)];
        let results = closure(&mut memory, &slots).unwrap();
        assert_eq!(results[0].as_u32(), 6);
    }
}
