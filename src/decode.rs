//! The decoder: flat slots + guest linear memory → host [`Value`] (spec.md
//! §4.E).

use crate::engine::{GuestPointer, InstanceWithFunction, InstanceWithMemory};
use crate::error::{AbiError, AbiResult};
use crate::flat::FlatValue;
use crate::flatten::flat_count;
use crate::layout::{align_up, layout};
use crate::memory::Memory;
use crate::value::Value;
use crate::wit_type::WitTypeDef;

/// Lifts `results` (one entry per result type) from `slots`, the flat
/// values a direct-return call produced (spec.md §4.E `decode_results`).
pub fn decode_results<Instance>(
    result_types: &[WitTypeDef],
    slots: &[FlatValue],
    memory: &Memory<'_, Instance>,
) -> AbiResult<Vec<Value>>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let mut cursor = 0usize;
    let mut results = Vec::with_capacity(result_types.len());
    for ty in result_types {
        let count = flat_count(ty);
        let slice = slots.get(cursor..cursor + count).ok_or_else(|| {
            AbiError::invalid("flat result stack is shorter than the declared result types")
        })?;
        results.push(lift_from_stack(ty, slice, memory)?.0);
        cursor += count;
    }
    Ok(results)
}

/// Lifts a single value of shape `ty` from the front of `slots`. Returns
/// the value and the number of slots consumed, so callers can walk a
/// flat sequence field-by-field (spec.md §4.E `lift_from_stack`).
pub fn lift_from_stack<Instance>(
    ty: &WitTypeDef,
    slots: &[FlatValue],
    memory: &Memory<'_, Instance>,
) -> AbiResult<(Value, usize)>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    use WitTypeDef::*;
    let first = || {
        slots
            .first()
            .copied()
            .ok_or_else(|| AbiError::invalid("flat stack exhausted while lifting a value"))
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
        Char => Value::Char(char_from_scalar(first()?.as_u32())?),
        Resource => Value::Resource(first()?.as_u32()),
        String => {
            let ptr = GuestPointer(first()?.as_u32());
            let len = slots
                .get(1)
                .ok_or_else(|| AbiError::invalid("string lift missing length slot"))?
                .as_u32();
            Value::String(load_string(ptr, len, memory)?)
        }
        List(element_ty) => {
            let ptr = GuestPointer(first()?.as_u32());
            let len = slots
                .get(1)
                .ok_or_else(|| AbiError::invalid("list lift missing length slot"))?
                .as_u32();
            Value::List(load_list(element_ty, ptr, len, memory)?)
        }
        Record(fields) => {
            let mut cursor = 0usize;
            let mut values = Vec::with_capacity(fields.len());
            for field in fields {
                let count = flat_count(&field.ty);
                let slice = slots.get(cursor..cursor + count).ok_or_else(|| {
                    AbiError::invalid("flat stack exhausted while lifting a record field")
                })?;
                values.push(lift_from_stack(&field.ty, slice, memory)?.0);
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
                values.push(lift_from_stack(element_ty, slice, memory)?.0);
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
                .map(|s| s.as_u32())
                .collect();
            return Ok((Value::Flags(words), word_count));
        }
        Variant(cases) => {
            let discriminant = first()?.as_u32();
            let case = cases.get(discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let payload_width = cases
                .iter()
                .map(|c| c.payload.as_ref().map(flat_count).unwrap_or(0))
                .max()
                .unwrap_or(0);
            let payload_slots = slots.get(1..1 + payload_width).ok_or_else(|| {
                AbiError::invalid("flat stack exhausted while lifting a variant payload")
            })?;
            let payload = match &case.payload {
                Some(payload_ty) => {
                    let used = flat_count(payload_ty);
                    Some(Box::new(lift_from_stack(payload_ty, &payload_slots[..used], memory)?.0))
                }
                None => None,
            };
            return Ok((Value::Variant(discriminant, payload), 1 + payload_width));
        }
        Option(inner_ty) => {
            let discriminant = first()?.as_u32();
            let inner_width = flat_count(inner_ty);
            let payload_slots = slots.get(1..1 + inner_width).ok_or_else(|| {
                AbiError::invalid("flat stack exhausted while lifting an option payload")
            })?;
            let payload = if discriminant != 0 {
                Some(Box::new(lift_from_stack(inner_ty, payload_slots, memory)?.0))
            } else {
                None
            };
            return Ok((Value::Option(payload), 1 + inner_width));
        }
        Result { ok, err } => {
            let discriminant = first()?.as_u32();
            let ok_width = ok.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            let err_width = err.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            let width = ok_width.max(err_width);
            let payload_slots = slots.get(1..1 + width).ok_or_else(|| {
                AbiError::invalid("flat stack exhausted while lifting a result payload")
            })?;
            let result = match discriminant {
                0 => Ok(match ok {
                    Some(ok_ty) => {
                        let used = flat_count(ok_ty);
                        Some(Box::new(lift_from_stack(ok_ty, &payload_slots[..used], memory)?.0))
                    }
                    None => None,
                }),
                1 => Err(match err {
                    Some(err_ty) => {
                        let used = flat_count(err_ty);
                        Some(Box::new(lift_from_stack(err_ty, &payload_slots[..used], memory)?.0))
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

/// Reads `value` back out of guest memory at `addr`, the counterpart to
/// [`crate::encode::store_to_memory`] used for indirect-return buffers and
/// nested aggregate fields (spec.md §4.E `load_value`).
pub fn load_value<Instance>(
    ty: &WitTypeDef,
    addr: GuestPointer,
    memory: &Memory<'_, Instance>,
) -> AbiResult<Value>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    use WitTypeDef::*;
    Ok(match ty {
        Bool => Value::Bool(read_u8(addr, memory)? != 0),
        U8 => Value::U8(read_u8(addr, memory)?),
        S8 => Value::S8(read_u8(addr, memory)? as i8),
        U16 => Value::U16(u16::from_le_bytes(read_exact(addr, memory)?)),
        S16 => Value::S16(i16::from_le_bytes(read_exact(addr, memory)?)),
        U32 => Value::U32(u32::from_le_bytes(read_exact(addr, memory)?)),
        S32 => Value::S32(i32::from_le_bytes(read_exact(addr, memory)?)),
        U64 => Value::U64(u64::from_le_bytes(read_exact(addr, memory)?)),
        S64 => Value::S64(i64::from_le_bytes(read_exact(addr, memory)?)),
        F32 => Value::F32(f32::from_le_bytes(read_exact(addr, memory)?)),
        F64 => Value::F64(f64::from_le_bytes(read_exact(addr, memory)?)),
        Char => Value::Char(char_from_scalar(u32::from_le_bytes(read_exact(addr, memory)?))?),
        Resource => Value::Resource(u32::from_le_bytes(read_exact(addr, memory)?)),
        String => {
            let ptr = GuestPointer(u32::from_le_bytes(read_exact(addr, memory)?));
            let len = u32::from_le_bytes(read_exact(addr.advance(4), memory)?);
            Value::String(load_string(ptr, len, memory)?)
        }
        List(element_ty) => {
            let ptr = GuestPointer(u32::from_le_bytes(read_exact(addr, memory)?));
            let len = u32::from_le_bytes(read_exact(addr.advance(4), memory)?);
            Value::List(load_list(element_ty, ptr, len, memory)?)
        }
        Record(fields) => {
            let mut values = Vec::with_capacity(fields.len());
            let mut offset = 0u32;
            for field in fields {
                let field_layout = layout(&field.ty);
                offset = align_up(offset, field_layout.alignment);
                values.push(load_value(&field.ty, addr.advance(offset), memory)?);
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
                values.push(load_value(element_ty, addr.advance(offset), memory)?);
                offset += element_layout.size;
            }
            Value::Tuple(values)
        }
        Enum(cases) => {
            let discriminant = u32::from_le_bytes(read_exact(addr, memory)?);
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
                words.push(u32::from_le_bytes(read_exact(addr.advance(i * 4), memory)?));
            }
            Value::Flags(words)
        }
        Variant(cases) => {
            let variant_layout = layout(ty);
            let discriminant = u32::from_le_bytes(read_exact(addr, memory)?);
            let case = cases.get(discriminant as usize).ok_or_else(|| {
                AbiError::invalid(format!("variant discriminant {discriminant} out of range"))
            })?;
            let payload = match &case.payload {
                Some(payload_ty) => Some(Box::new(load_value(
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
            let discriminant = read_u8(addr, memory)?;
            let payload = if discriminant != 0 {
                Some(Box::new(load_value(
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
            let discriminant = read_u8(addr, memory)?;
            let payload_addr = addr.advance(result_layout.field_offsets[1]);
            match discriminant {
                0 => Value::Result(Ok(match ok {
                    Some(ok_ty) => Some(Box::new(load_value(ok_ty, payload_addr, memory)?)),
                    None => None,
                })),
                1 => Value::Result(Err(match err {
                    Some(err_ty) => Some(Box::new(load_value(err_ty, payload_addr, memory)?)),
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

fn char_from_scalar(scalar: u32) -> AbiResult<char> {
    char::from_u32(scalar)
        .ok_or_else(|| AbiError::invalid(format!("{scalar:#x} is not a valid Unicode scalar value")))
}

fn read_u8<Instance>(addr: GuestPointer, memory: &Memory<'_, Instance>) -> AbiResult<u8>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    Ok(memory.read(addr, 1)?[0])
}

fn read_exact<Instance, const N: usize>(
    addr: GuestPointer,
    memory: &Memory<'_, Instance>,
) -> AbiResult<[u8; N]>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let bytes = memory.read(addr, N as u32)?;
    bytes
        .try_into()
        .map_err(|_| AbiError::invalid("short read from guest memory"))
}

fn load_string<Instance>(ptr: GuestPointer, len: u32, memory: &Memory<'_, Instance>) -> AbiResult<String>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let bytes = memory.read(ptr, len)?;
    String::from_utf8(bytes).map_err(|_| AbiError::invalid("string is not valid UTF-8"))
}

fn load_list<Instance>(
    element_ty: &WitTypeDef,
    ptr: GuestPointer,
    len: u32,
    memory: &Memory<'_, Instance>,
) -> AbiResult<Vec<Value>>
where
    Instance: InstanceWithMemory + InstanceWithFunction,
{
    let element_layout = layout(element_ty);
    let stride = align_up(element_layout.size, element_layout.alignment);
    let mut elements = Vec::with_capacity(len as usize);
    for i in 0..len {
        elements.push(load_value(element_ty, ptr.advance(i * stride), memory)?);
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_from_scalar_rejects_surrogates() {
        assert!(char_from_scalar(0xD800).is_err());
        assert!(char_from_scalar('a' as u32).is_ok());
    }
}
