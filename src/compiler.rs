//! The type compiler: caches a native Rust type's [`WitTypeDef`], memory
//! layout, and flat slot list behind its [`TypeId`], so a hot call path
//! never has to recompute them (spec.md §4.C/§9 "compiled plan" cache).

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{AbiError, AbiResult};
use crate::flat::FlatType;
use crate::flatten::flat_type_list;
use crate::layout::{layout, MemoryLayout};
use crate::native::WitType;
use crate::wit_type::WitTypeDef;

/// Everything the encoder/decoder/dispatcher need to know about a
/// compiled WIT shape, computed once per native type and reused for
/// every call (spec.md §4.C).
#[derive(Clone, Debug)]
pub struct CompiledPlan {
    pub wit_type: WitTypeDef,
    pub layout: MemoryLayout,
    pub flat_types: Vec<FlatType>,
}

impl CompiledPlan {
    fn new(wit_type: WitTypeDef) -> Self {
        let memory_layout = layout(&wit_type);
        let flat_types = flat_type_list(&wit_type);
        CompiledPlan {
            wit_type,
            layout: memory_layout,
            flat_types,
        }
    }

    /// Number of flat call-stack slots this shape occupies.
    pub fn flat_count(&self) -> usize {
        self.flat_types.len()
    }

    /// `true` when every flat slot of this shape, read back in order,
    /// reconstructs the value without needing the canonical recursive
    /// walk — i.e. the shape is a single primitive or a record/tuple of
    /// only such primitives with no string/list/variant/option/result
    /// children. The dispatcher's word-reconstruction fast path is only
    /// sound for these shapes (spec.md open question: "word
    /// reconstruction vs `load_value`").
    pub fn is_word_reconstructible(&self) -> bool {
        fn check(ty: &WitTypeDef) -> bool {
            use WitTypeDef::*;
            match ty {
                Bool | U8 | S8 | U16 | S16 | U32 | S32 | U64 | S64 | F32 | F64 | Char | Resource
                | Enum(_) => true,
                Record(fields) => fields.iter().all(|f| check(&f.ty)),
                Tuple(elements) => elements.iter().all(check),
                String | List(_) | Variant(_) | Flags(_) | Option(_) | Result { .. } => false,
            }
        }
        check(&self.wit_type)
    }
}

/// Caches [`CompiledPlan`]s by the [`TypeId`] of the native Rust type they
/// were compiled for. Shared across calls to a given runtime/instance;
/// `RwLock` rather than `Mutex` since lookups (the overwhelmingly common
/// case, a warm cache) never need exclusive access (spec.md §4.C: "reads
/// vastly outnumber writes once a process's working set of types has been
/// seen once").
#[derive(Default)]
pub struct TypeCompiler {
    cache: RwLock<HashMap<TypeId, CompiledPlan>>,
}

impl TypeCompiler {
    pub fn new() -> Self {
        TypeCompiler::default()
    }

    /// Returns the cached [`CompiledPlan`] for `T`, computing and
    /// inserting it on a cold lookup. Fails only if `T`'s
    /// [`WitType::wit_type_def`] describes a shape the layout/flattening
    /// rules can't compute — in practice this can't currently happen, but
    /// the signature leaves room for a future descriptor-validation pass
    /// (spec.md §4.C: "compilation fails when a requested native type
    /// cannot represent the WIT type").
    pub fn compile<T: WitType + Any>(&self) -> AbiResult<CompiledPlan> {
        let type_id = TypeId::of::<T>();
        if let Some(plan) = self.read_cached(type_id) {
            return Ok(plan);
        }
        let plan = CompiledPlan::new(T::wit_type_def());
        let mut cache = self
            .cache
            .write()
            .map_err(|_| AbiError::internal("type compiler cache lock poisoned"))?;
        Ok(cache.entry(type_id).or_insert(plan).clone())
    }

    fn read_cached(&self, type_id: TypeId) -> Option<CompiledPlan> {
        let cache = self.cache.read().ok()?;
        cache.get(&type_id).cloned()
    }

    /// Number of distinct native types compiled so far, for diagnostics
    /// and tests.
    pub fn len(&self) -> usize {
        self.cache.read().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiling_the_same_type_twice_hits_the_cache() {
        let compiler = TypeCompiler::new();
        let first = compiler.compile::<u32>().unwrap();
        assert_eq!(compiler.len(), 1);
        let second = compiler.compile::<u32>().unwrap();
        assert_eq!(compiler.len(), 1);
        assert_eq!(first.wit_type, second.wit_type);
        assert_eq!(first.flat_types, second.flat_types);
    }

    #[test]
    fn compiling_distinct_types_grows_the_cache() {
        let compiler = TypeCompiler::new();
        compiler.compile::<u32>().unwrap();
        compiler.compile::<String>().unwrap();
        assert_eq!(compiler.len(), 2);
    }

    #[test]
    fn primitive_tuple_is_word_reconstructible_but_string_is_not() {
        let compiler = TypeCompiler::new();
        let tuple_plan = compiler.compile::<(u32, bool)>().unwrap();
        assert!(tuple_plan.is_word_reconstructible());

        let string_plan = compiler.compile::<String>().unwrap();
        assert!(!string_plan.is_word_reconstructible());
    }
}
