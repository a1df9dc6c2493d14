//! The encoder: host [`Value`] → flat slots + heap writes in guest linear
//! memory (spec.md §4.D).

use crate::allocator::AllocList;
use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::{FlatType, FlatValue};
use crate::flatten::flat_type_list;
use crate::layout::{align_up, layout};
use crate::memory::Memory;
use crate::value::{shape_matches, Value};
use crate::wit_type::WitTypeDef;

/// Lowers `value` (of shape `ty`) onto the flat call stack, allocating in
/// guest memory for any out-of-line data (strings, lists). On error,
/// every allocation made so far is released through `alloc_list` before
/// the error is returned (spec.md §4.D/§8 "allocator contract").
pub fn lower_to_stack<Instance>(
    ty: &WitTypeDef,
    value: &Value,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<Vec<FlatValue>>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    match lower_to_stack_inner(ty, value, memory, alloc_list) {
        Ok(slots) => Ok(slots),
        Err(error) => {
            memory.free_all_tracked(alloc_list);
            Err(error)
        }
    }
}

/// Lowers each parameter value against its corresponding type, in order,
/// concatenating their flat slots (spec.md §4.D `encode_params`).
pub fn encode_params<Instance>(
    param_types: &[WitTypeDef],
    values: &[Value],
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<Vec<FlatValue>>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    if param_types.len() != values.len() {
        return Err(AbiError::invalid(format!(
            "expected {} parameters, got {}",
            param_types.len(),
            values.len()
        )));
    }
    let mut slots = Vec::new();
    for (ty, value) in param_types.iter().zip(values) {
        match lower_to_stack_inner(ty, value, memory, alloc_list) {
            Ok(mut value_slots) => slots.append(&mut value_slots),
            Err(error) => {
                memory.free_all_tracked(alloc_list);
                return Err(error);
            }
        }
    }
    Ok(slots)
}

/// Lays `value` out in guest memory at `addr`, per the memory layout of
/// `ty` (spec.md §4.D `store_to_memory`, used for the indirect-return
/// convention and for nested aggregate fields).
pub fn store_to_memory<Instance>(
    ty: &WitTypeDef,
    value: &Value,
    addr: GuestPointer,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<()>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    if !shape_matches(ty, value) {
        return Err(AbiError::invalid(format!(
            "cannot store a `{}` value as `{ty:?}`",
            value.shape_name()
        )));
    }
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
        (String, Value::String(s)) => store_bytes(s.as_bytes(), 1, addr, memory, alloc_list),
        (List(element_ty), Value::List(elements)) => {
            store_list(element_ty, elements, addr, memory, alloc_list)
        }
        (Record(fields), Value::Record(values)) => {
            store_sequence(fields.iter().map(|f| &f.ty), values, addr, memory, alloc_list)
        }
        (Tuple(element_tys), Value::Tuple(values)) => {
            store_sequence(element_tys.iter(), values, addr, memory, alloc_list)
        }
        (Enum(_), Value::Enum(discriminant)) => memory.write(addr, &discriminant.to_le_bytes()),
        (Flags(flags), Value::Flags(words)) => {
            let expected_words = crate::layout::flags_word_count(flags.len()) as usize;
            if words.len() != expected_words {
                return Err(AbiError::invalid("flags word count mismatch"));
            }
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
            let payload_offset = variant_layout.field_offsets[1];
            if let Some(payload_ty) = &case.payload {
                let payload_value = payload
                    .as_ref()
                    .ok_or_else(|| AbiError::invalid("variant case expects a payload"))?;
                store_to_memory(
                    payload_ty,
                    payload_value,
                    addr.advance(payload_offset),
                    memory,
                    alloc_list,
                )?;
            }
            Ok(())
        }
        (Option(inner_ty), Value::Option(payload)) => {
            let option_layout = layout(ty);
            let payload_offset = option_layout.field_offsets[1];
            match payload {
                Some(inner) => {
                    memory.write(addr, &1u8.to_le_bytes())?;
                    store_to_memory(inner_ty, inner, addr.advance(payload_offset), memory, alloc_list)
                }
                None => memory.write(addr, &0u8.to_le_bytes()),
            }
        }
        (Result { ok, err }, Value::Result(result)) => {
            let result_layout = layout(ty);
            let payload_offset = result_layout.field_offsets[1];
            match result {
                Ok(payload) => {
                    memory.write(addr, &0u8.to_le_bytes())?;
                    if let (Some(ok_ty), Some(inner)) = (ok, payload) {
                        store_to_memory(ok_ty, inner, addr.advance(payload_offset), memory, alloc_list)?;
                    }
                    Ok(())
                }
                Err(payload) => {
                    memory.write(addr, &1u8.to_le_bytes())?;
                    if let (Some(err_ty), Some(inner)) = (err, payload) {
                        store_to_memory(err_ty, inner, addr.advance(payload_offset), memory, alloc_list)?;
                    }
                    Ok(())
                }
            }
        }
        _ => unreachable!("shape_matches already rejected mismatched (ty, value) pairs"),
    }
}

fn lower_to_stack_inner<Instance>(
    ty: &WitTypeDef,
    value: &Value,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<Vec<FlatValue>>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    if !shape_matches(ty, value) {
        return Err(AbiError::invalid(format!(
            "cannot lower a `{}` value as `{ty:?}`",
            value.shape_name()
        )));
    }
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
            let ptr = store_bytes_allocating(s.as_bytes(), 1, memory, alloc_list)?;
            vec![FlatValue::I32(ptr.0), FlatValue::I32(s.len() as u32)]
        }
        (List(element_ty), Value::List(elements)) => {
            let element_layout = layout(element_ty);
            let stride = align_up(element_layout.size, element_layout.alignment);
            let total = stride * elements.len() as u32;
            let ptr = memory.allocate(alloc_list, total.max(1), element_layout.alignment.max(1))?;
            for (i, element) in elements.iter().enumerate() {
                store_to_memory(
                    element_ty,
                    element,
                    ptr.advance((i as u32) * stride),
                    memory,
                    alloc_list,
                )?;
            }
            vec![FlatValue::I32(ptr.0), FlatValue::I32(elements.len() as u32)]
        }
        (Record(fields), Value::Record(values)) => {
            let mut slots = Vec::new();
            for (field, value) in fields.iter().zip(values) {
                slots.append(&mut lower_to_stack_inner(&field.ty, value, memory, alloc_list)?);
            }
            slots
        }
        (Tuple(element_tys), Value::Tuple(values)) => {
            let mut slots = Vec::new();
            for (ty, value) in element_tys.iter().zip(values) {
                slots.append(&mut lower_to_stack_inner(ty, value, memory, alloc_list)?);
            }
            slots
        }
        (Enum(_), Value::Enum(discriminant)) => vec![FlatValue::I32(*discriminant)],
        (Flags(flags), Value::Flags(words)) => {
            let expected_words = crate::layout::flags_word_count(flags.len()) as usize;
            if words.len() != expected_words {
                return Err(AbiError::invalid("flags word count mismatch"));
            }
            words.iter().map(|w| FlatValue::I32(*w)).collect()
        }
        (Variant(cases), Value::Variant(discriminant, payload)) => {
            let case = cases.get(*discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let payload_flat_types: Vec<FlatType> = cases
                .iter()
                .map(|c| c.payload.as_ref().map(flat_type_list).unwrap_or_default())
                .max_by_key(|slots| slots.len())
                .unwrap_or_default();
            let mut payload_slots = match (&case.payload, payload) {
                (Some(payload_ty), Some(inner)) => {
                    lower_to_stack_inner(payload_ty, inner, memory, alloc_list)?
                }
                (None, None) => Vec::new(),
                _ => return Err(AbiError::invalid("variant case/payload mismatch")),
            };
            payload_slots.resize_with(payload_flat_types.len(), || FlatValue::I32(0));
            for (slot, flat_type) in payload_slots.iter_mut().zip(&payload_flat_types) {
                if slot.flat_type() != *flat_type {
                    *slot = FlatValue::zero(*flat_type);
                }
            }
            let mut slots = vec![FlatValue::I32(*discriminant)];
            slots.extend(payload_slots);
            slots
        }
        (Option(inner_ty), Value::Option(payload)) => {
            let payload_flat_types = flat_type_list(inner_ty);
            let mut slots = vec![FlatValue::I32(payload.is_some() as u32)];
            let payload_slots = match payload {
                Some(inner) => lower_to_stack_inner(inner_ty, inner, memory, alloc_list)?,
                None => payload_flat_types.iter().map(|t| FlatValue::zero(*t)).collect(),
            };
            slots.extend(payload_slots);
            slots
        }
        (Result { ok, err }, Value::Result(result)) => {
            let ok_flat = ok.as_ref().map(|t| flat_type_list(t)).unwrap_or_default();
            let err_flat = err.as_ref().map(|t| flat_type_list(t)).unwrap_or_default();
            let width = ok_flat.len().max(err_flat.len());
            let padding_types = if ok_flat.len() >= err_flat.len() { &ok_flat } else { &err_flat };
            let (discriminant, mut payload_slots) = match result {
                Ok(payload) => (
                    0u32,
                    match (ok, payload) {
                        (Some(ty), Some(inner)) => lower_to_stack_inner(ty, inner, memory, alloc_list)?,
                        (None, None) => Vec::new(),
                        _ => return Err(AbiError::invalid("result ok arm/payload mismatch")),
                    },
                ),
                Err(payload) => (
                    1u32,
                    match (err, payload) {
                        (Some(ty), Some(inner)) => lower_to_stack_inner(ty, inner, memory, alloc_list)?,
                        (None, None) => Vec::new(),
                        _ => return Err(AbiError::invalid("result err arm/payload mismatch")),
                    },
                ),
            };
            payload_slots.resize_with(width, || FlatValue::I32(0));
            for (slot, flat_type) in payload_slots.iter_mut().zip(padding_types) {
                if slot.flat_type() != *flat_type {
                    *slot = FlatValue::zero(*flat_type);
                }
            }
            let mut slots = vec![FlatValue::I32(discriminant)];
            slots.extend(payload_slots);
            slots
        }
        _ => unreachable!("shape_matches already rejected mismatched (ty, value) pairs"),
    };
    Ok(slots)
}

fn store_bytes<Instance>(
    bytes: &[u8],
    _alignment: u32,
    addr: GuestPointer,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<()>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let ptr = store_bytes_allocating(bytes, 1, memory, alloc_list)?;
    memory.write(addr, &ptr.0.to_le_bytes())?;
    memory.write(addr.advance(4), &(bytes.len() as u32).to_le_bytes())
}

fn store_bytes_allocating<Instance>(
    bytes: &[u8],
    alignment: u32,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<GuestPointer>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let ptr = memory.allocate(alloc_list, (bytes.len() as u32).max(1), alignment)?;
    if !bytes.is_empty() {
        memory.write(ptr, bytes)?;
    }
    Ok(ptr)
}

fn store_list<Instance>(
    element_ty: &WitTypeDef,
    elements: &[Value],
    addr: GuestPointer,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<()>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let element_layout = layout(element_ty);
    let stride = align_up(element_layout.size, element_layout.alignment);
    let total = stride * elements.len() as u32;
    let ptr = memory.allocate(alloc_list, total.max(1), element_layout.alignment.max(1))?;
    for (i, element) in elements.iter().enumerate() {
        store_to_memory(element_ty, element, ptr.advance((i as u32) * stride), memory, alloc_list)?;
    }
    memory.write(addr, &ptr.0.to_le_bytes())?;
    memory.write(addr.advance(4), &(elements.len() as u32).to_le_bytes())
}

fn store_sequence<'a, Instance>(
    tys: impl Iterator<Item = &'a WitTypeDef>,
    values: &[Value],
    addr: GuestPointer,
    memory: &mut Memory<'_, Instance>,
    alloc_list: &mut AllocList,
) -> AbiResult<()>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let mut offset = 0u32;
    for (ty, value) in tys.zip(values) {
        let field_layout = layout(ty);
        offset = align_up(offset, field_layout.alignment);
        store_to_memory(ty, value, addr.advance(offset), memory, alloc_list)?;
        offset += field_layout.size;
    }
    Ok(())
}
