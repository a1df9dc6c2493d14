//! Flattening rules: how many flat call-stack slots a WIT type occupies,
//! and whether a list of result types fits in a direct return (spec.md
//! §4.A).

use crate::flat::FlatType;
use crate::wit_type::WitTypeDef;

/// Number of flat slots `ty` occupies on the call stack (spec.md §3/§4.A).
pub fn flat_count(ty: &WitTypeDef) -> usize {
    use WitTypeDef::*;
    match ty {
        Bool | U8 | S8 | U16 | S16 | U32 | S32 | Char | Resource => 1,
        U64 | S64 => 1,
        F32 => 1,
        F64 => 1,
        String | List(_) => 2,
        Record(fields) => fields.iter().map(|f| flat_count(&f.ty)).sum(),
        Tuple(elements) => elements.iter().map(flat_count).sum(),
        Enum(_) => 1,
        Flags(flags) => crate::layout::flags_word_count(flags.len()) as usize,
        Variant(cases) => {
            1 + cases
                .iter()
                .map(|c| c.payload.as_ref().map(flat_count).unwrap_or(0))
                .max()
                .unwrap_or(0)
        }
        Option(inner) => 1 + flat_count(inner),
        Result { ok, err } => {
            let ok_count = ok.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            let err_count = err.as_ref().map(|t| flat_count(t)).unwrap_or(0);
            1 + ok_count.max(err_count)
        }
    }
}

/// The ordered flat slot kinds used to register `ty` with the engine as a
/// sequence of `i32`/`i64`/`f32`/`f64` parameters (spec.md §4.A).
pub fn flat_type_list(ty: &WitTypeDef) -> Vec<FlatType> {
    use WitTypeDef::*;
    match ty {
        Bool | U8 | S8 | U16 | S16 | U32 | S32 | Char | Resource | Enum(_) => vec![FlatType::I32],
        U64 | S64 => vec![FlatType::I64],
        F32 => vec![FlatType::F32],
        F64 => vec![FlatType::F64],
        String | List(_) => vec![FlatType::I32, FlatType::I32],
        Flags(flags) => vec![FlatType::I32; crate::layout::flags_word_count(flags.len()) as usize],
        Record(fields) => fields.iter().flat_map(|f| flat_type_list(&f.ty)).collect(),
        Tuple(elements) => elements.iter().flat_map(flat_type_list).collect(),
        Variant(cases) => {
            let payload_slots = cases
                .iter()
                .map(|c| {
                    c.payload
                        .as_ref()
                        .map(flat_type_list)
                        .unwrap_or_default()
                })
                .max_by_key(|slots| slots.len())
                .unwrap_or_default();
            std::iter::once(FlatType::I32).chain(payload_slots).collect()
        }
        Option(inner) => std::iter::once(FlatType::I32)
            .chain(flat_type_list(inner))
            .collect(),
        Result { ok, err } => {
            let ok_slots = ok.as_ref().map(|t| flat_type_list(t)).unwrap_or_default();
            let err_slots = err.as_ref().map(|t| flat_type_list(t)).unwrap_or_default();
            let payload_slots = if ok_slots.len() >= err_slots.len() {
                ok_slots
            } else {
                err_slots
            };
            std::iter::once(FlatType::I32).chain(payload_slots).collect()
        }
    }
}

/// `true` when the combined flat count of `results` fits a direct return
/// under `max_flat_results` (spec.md §4.A/§6 — the `MAX_FLAT_RESULTS`
/// boundary between direct and indirect/return-pointer returns).
pub fn direct_return_ok(results: &[WitTypeDef], max_flat_results: usize) -> bool {
    results.iter().map(flat_count).sum::<usize>() <= max_flat_results
}

/// Whether a call returning `results` needs a return-pointer parameter,
/// the complement of [`direct_return_ok`] (spec.md §6).
pub fn uses_retptr(results: &[WitTypeDef], max_flat_results: usize) -> bool {
    !direct_return_ok(results, max_flat_results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wit_type::{Case, Field, WitTypeDef};

    #[test]
    fn primitive_flat_counts_match_spec() {
        assert_eq!(flat_count(&WitTypeDef::Bool), 1);
        assert_eq!(flat_count(&WitTypeDef::String), 2);
        assert_eq!(flat_count(&WitTypeDef::list(WitTypeDef::U8)), 2);
    }

    #[test]
    fn record_flat_count_sums_fields() {
        let record = WitTypeDef::Record(vec![
            Field {
                name: "name".into(),
                ty: WitTypeDef::String,
            },
            Field {
                name: "age".into(),
                ty: WitTypeDef::U32,
            },
        ]);
        assert_eq!(flat_count(&record), 3);
    }

    #[test]
    fn option_and_result_add_a_discriminant_slot() {
        assert_eq!(flat_count(&WitTypeDef::option(WitTypeDef::U64)), 2);
        assert_eq!(
            flat_count(&WitTypeDef::result(Some(WitTypeDef::S32), Some(WitTypeDef::S32))),
            2
        );
        // result<T, E> is 1 + max(flat(T), flat(E)), not the sum.
        assert_eq!(
            flat_count(&WitTypeDef::result(
                Some(WitTypeDef::U64),
                Some(WitTypeDef::Bool)
            )),
            2
        );
    }

    #[test]
    fn variant_flat_count_is_one_plus_max_case() {
        let variant = WitTypeDef::Variant(vec![
            Case {
                name: "a".into(),
                payload: Some(WitTypeDef::U32),
            },
            Case {
                name: "b".into(),
                payload: Some(WitTypeDef::String),
            },
            Case {
                name: "c".into(),
                payload: None,
            },
        ]);
        assert_eq!(flat_count(&variant), 3); // 1 + max(1, 2, 0)
    }

    #[test]
    fn direct_return_ok_respects_max_flat_results() {
        assert!(direct_return_ok(&[WitTypeDef::S32], 1));
        assert!(!direct_return_ok(&[WitTypeDef::String], 1));
        assert!(uses_retptr(&[WitTypeDef::String], 1));
    }
}
