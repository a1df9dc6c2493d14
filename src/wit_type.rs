//! [`WitTypeDef`]: a closed, reflective description of a WIT type (spec.md
//! §3's "closed algebraic set of shapes"). Unlike the [`crate::native::WitType`]
//! trait, this is a runtime *value*, used for cross-checking a native
//! descriptor against a type handed over by the (external) component front
//! end, and for the dynamic paths the dispatcher and compiler fall back to.

/// A field of a [`WitTypeDef::Record`] or [`WitTypeDef::Tuple`].
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub ty: WitTypeDef,
}

/// A case of a [`WitTypeDef::Variant`].
#[derive(Clone, Debug, PartialEq)]
pub struct Case {
    pub name: String,
    pub payload: Option<WitTypeDef>,
}

/// The closed set of WIT type shapes (spec.md §3).
#[derive(Clone, Debug, PartialEq)]
pub enum WitTypeDef {
    Bool,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    S64,
    F32,
    F64,
    Char,
    String,
    List(Box<WitTypeDef>),
    Record(Vec<Field>),
    Tuple(Vec<WitTypeDef>),
    Variant(Vec<Case>),
    Enum(Vec<String>),
    Flags(Vec<String>),
    Option(Box<WitTypeDef>),
    Result {
        ok: Option<Box<WitTypeDef>>,
        err: Option<Box<WitTypeDef>>,
    },
    Resource,
}

impl WitTypeDef {
    /// Convenience constructor for [`WitTypeDef::List`].
    pub fn list(element: WitTypeDef) -> Self {
        WitTypeDef::List(Box::new(element))
    }

    /// Convenience constructor for [`WitTypeDef::Option`].
    pub fn option(inner: WitTypeDef) -> Self {
        WitTypeDef::Option(Box::new(inner))
    }

    /// Convenience constructor for [`WitTypeDef::Result`].
    pub fn result(ok: Option<WitTypeDef>, err: Option<WitTypeDef>) -> Self {
        WitTypeDef::Result {
            ok: ok.map(Box::new),
            err: err.map(Box::new),
        }
    }

    /// True for the primitive leaf shapes (everything with no children).
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            WitTypeDef::Bool
                | WitTypeDef::U8
                | WitTypeDef::S8
                | WitTypeDef::U16
                | WitTypeDef::S16
                | WitTypeDef::U32
                | WitTypeDef::S32
                | WitTypeDef::U64
                | WitTypeDef::S64
                | WitTypeDef::F32
                | WitTypeDef::F64
                | WitTypeDef::Char
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_and_option_constructors_box_their_element() {
        let list = WitTypeDef::list(WitTypeDef::S32);
        assert_eq!(list, WitTypeDef::List(Box::new(WitTypeDef::S32)));

        let opt = WitTypeDef::option(WitTypeDef::String);
        assert_eq!(opt, WitTypeDef::Option(Box::new(WitTypeDef::String)));
    }

    #[test]
    fn primitives_are_recognized() {
        assert!(WitTypeDef::U32.is_primitive());
        assert!(WitTypeDef::Char.is_primitive());
        assert!(!WitTypeDef::String.is_primitive());
        assert!(!WitTypeDef::list(WitTypeDef::U8).is_primitive());
    }
}
