//! Size/alignment/offset computation for WIT types (spec.md §4.B).

use crate::wit_type::WitTypeDef;

/// The size, alignment, and (for aggregates) field offsets of a WIT type
/// laid out in guest linear memory.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryLayout {
    pub size: u32,
    pub alignment: u32,
    /// Byte offset of each field/case-payload, in declaration order, when
    /// `ty` is a `Record`/`Tuple`/`Variant`. Empty for everything else.
    pub field_offsets: Vec<u32>,
}

impl MemoryLayout {
    fn leaf(size: u32, alignment: u32) -> Self {
        MemoryLayout {
            size,
            alignment,
            field_offsets: Vec::new(),
        }
    }
}

/// Rounds `offset` up to the next multiple of `alignment` (`alignment`
/// must be a power of two).
pub fn align_up(offset: u32, alignment: u32) -> u32 {
    debug_assert!(alignment.is_power_of_two());
    (offset + alignment - 1) & !(alignment - 1)
}

/// Computes the [`MemoryLayout`] of `ty` per the component-model layout
/// rules in spec.md §3/§4.B.
pub fn layout(ty: &WitTypeDef) -> MemoryLayout {
    use WitTypeDef::*;
    match ty {
        Bool | U8 | S8 => MemoryLayout::leaf(1, 1),
        U16 | S16 => MemoryLayout::leaf(2, 2),
        U32 | S32 | F32 | Char => MemoryLayout::leaf(4, 4),
        U64 | S64 | F64 => MemoryLayout::leaf(8, 8),
        String | List(_) => MemoryLayout::leaf(8, 4),
        Resource => MemoryLayout::leaf(4, 4),
        Record(fields) => layout_sequence(fields.iter().map(|f| &f.ty)),
        Tuple(elements) => layout_sequence(elements.iter()),
        Enum(cases) => discriminant_layout(cases.len()),
        Flags(flags) => flags_layout(flags.len()),
        Variant(cases) => {
            let discriminant = discriminant_layout(cases.len());
            let mut max_payload_size = 0;
            let mut max_payload_align = 1;
            for case in cases {
                if let Some(payload) = &case.payload {
                    let payload_layout = layout(payload);
                    max_payload_size = max_payload_size.max(payload_layout.size);
                    max_payload_align = max_payload_align.max(payload_layout.alignment);
                }
            }
            let alignment = discriminant.alignment.max(max_payload_align);
            let payload_offset = align_up(discriminant.size, max_payload_align);
            let total = align_up(payload_offset + max_payload_size, alignment);
            MemoryLayout {
                size: total,
                alignment,
                field_offsets: vec![0, payload_offset],
            }
        }
        Option(inner) => {
            let inner_layout = layout(inner);
            let alignment = inner_layout.alignment.max(1);
            let payload_offset = align_up(1, inner_layout.alignment.max(1));
            let total = align_up(payload_offset + inner_layout.size, alignment);
            MemoryLayout {
                size: total,
                alignment,
                field_offsets: vec![0, payload_offset],
            }
        }
        Result { ok, err } => {
            let mut max_size = 0;
            let mut max_align = 1;
            for arm in [ok, err].into_iter().flatten() {
                let arm_layout = layout(arm);
                max_size = max_size.max(arm_layout.size);
                max_align = max_align.max(arm_layout.alignment);
            }
            let payload_offset = align_up(1, max_align);
            let total = align_up(payload_offset + max_size, max_align);
            MemoryLayout {
                size: total,
                alignment: max_align,
                field_offsets: vec![0, payload_offset],
            }
        }
    }
}

/// Shared record/tuple layout: each field placed at the next offset that
/// satisfies its alignment, total size rounded up to the max field
/// alignment (spec.md §3).
fn layout_sequence<'a>(fields: impl Iterator<Item = &'a WitTypeDef>) -> MemoryLayout {
    let mut offset = 0u32;
    let mut alignment = 1u32;
    let mut field_offsets = Vec::new();
    for field in fields {
        let field_layout = layout(field);
        offset = align_up(offset, field_layout.alignment);
        field_offsets.push(offset);
        offset += field_layout.size;
        alignment = alignment.max(field_layout.alignment);
    }
    MemoryLayout {
        size: align_up(offset, alignment),
        alignment,
        field_offsets,
    }
}

/// `enum`/small `flags` discriminant: a single 4-byte i32 slot.
fn discriminant_layout(_case_count: usize) -> MemoryLayout {
    MemoryLayout::leaf(4, 4)
}

/// `flags` with more than 32 members need additional 32-bit words; callers
/// with a fixed `flags` set pick the concrete layout via [`flags_word_count`].
fn flags_layout(flag_count: usize) -> MemoryLayout {
    let words = flags_word_count(flag_count);
    MemoryLayout::leaf(words * 4, 4)
}

/// Number of 32-bit words needed to store `flag_count` `flags` bits.
pub fn flags_word_count(flag_count: usize) -> u32 {
    ((flag_count as u32) + 31) / 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wit_type::{Field, WitTypeDef};

    #[test]
    fn primitive_sizes_match_spec() {
        assert_eq!(layout(&WitTypeDef::Bool).size, 1);
        assert_eq!(layout(&WitTypeDef::U32).size, 4);
        assert_eq!(layout(&WitTypeDef::U64).size, 8);
        assert_eq!(layout(&WitTypeDef::Char).size, 4);
        assert_eq!(layout(&WitTypeDef::String).size, 8);
        assert_eq!(layout(&WitTypeDef::String).alignment, 4);
    }

    #[test]
    fn record_fields_are_placed_at_aligned_offsets() {
        // { a: u8, b: u32, c: u8 } -> offsets 0, 4, 8; size rounds to 12.
        let record = WitTypeDef::Record(vec![
            Field {
                name: "a".into(),
                ty: WitTypeDef::U8,
            },
            Field {
                name: "b".into(),
                ty: WitTypeDef::U32,
            },
            Field {
                name: "c".into(),
                ty: WitTypeDef::U8,
            },
        ]);
        let computed = layout(&record);
        assert_eq!(computed.field_offsets, vec![0, 4, 8]);
        assert_eq!(computed.alignment, 4);
        assert_eq!(computed.size, 12);
    }

    #[test]
    fn option_reserves_a_discriminant_byte_before_the_payload() {
        let option = WitTypeDef::option(WitTypeDef::U32);
        let computed = layout(&option);
        assert_eq!(computed.field_offsets, vec![0, 4]);
        assert_eq!(computed.size, 8);
    }

    #[test]
    fn flags_word_count_rounds_up() {
        assert_eq!(flags_word_count(1), 1);
        assert_eq!(flags_word_count(32), 1);
        assert_eq!(flags_word_count(33), 2);
    }
}
