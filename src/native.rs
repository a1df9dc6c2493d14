//! Native ⇄ WIT type descriptors (spec.md §9: "a user-facing type
//! descriptor/trait per shape, with a derive-style mechanism for records
//! and a small combinator for variants").
//!
//! A type implementing [`WitType`] declares which [`WitTypeDef`] shape it
//! represents and how to convert to/from the dynamic [`Value`]
//! representation the encoder and decoder operate on.

use crate::error::{AbiError, AbiResult};
use crate::value::Value;
use crate::wit_type::WitTypeDef;

/// A Rust type that can stand in for a WIT type across the canonical ABI
/// boundary.
pub trait WitType: Sized {
    /// The WIT type shape this Rust type represents. Returns a fresh
    /// [`WitTypeDef`] each call; callers that need this repeatedly should
    /// go through [`crate::compiler::TypeCompiler`], which caches it.
    fn wit_type_def() -> WitTypeDef;

    /// Converts this value into its dynamic [`Value`] representation, for
    /// the encoder to lower.
    fn to_value(&self) -> Value;

    /// Reconstructs `Self` from a [`Value`] the decoder produced.
    /// Compilation-time failure (spec.md §4.C: "a requested native type
    /// cannot represent the WIT type") surfaces here as a runtime
    /// [`AbiError`] when the dynamic value's shape doesn't match.
    fn from_value(value: Value) -> AbiResult<Self>;
}

fn shape_mismatch(expected: &str, value: &Value) -> AbiError {
    AbiError::invalid(format!(
        "expected a `{expected}` value, found `{}`",
        value.shape_name()
    ))
}

macro_rules! impl_wit_type_for_int {
    ($ty:ty, $def:ident, $variant:ident) => {
        impl WitType for $ty {
            fn wit_type_def() -> WitTypeDef {
                WitTypeDef::$def
            }

            fn to_value(&self) -> Value {
                Value::$variant(*self)
            }

            fn from_value(value: Value) -> AbiResult<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(shape_mismatch(stringify!($ty), &other)),
                }
            }
        }
    };
}

impl_wit_type_for_int!(bool, Bool, Bool);
impl_wit_type_for_int!(u8, U8, U8);
impl_wit_type_for_int!(i8, S8, S8);
impl_wit_type_for_int!(u16, U16, U16);
impl_wit_type_for_int!(i16, S16, S16);
impl_wit_type_for_int!(u32, U32, U32);
impl_wit_type_for_int!(i32, S32, S32);
impl_wit_type_for_int!(u64, U64, U64);
impl_wit_type_for_int!(i64, S64, S64);
impl_wit_type_for_int!(f32, F32, F32);
impl_wit_type_for_int!(f64, F64, F64);

impl WitType for char {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::Char
    }

    fn to_value(&self) -> Value {
        Value::Char(*self)
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            // A decode failure here is the "invalid scalars cause a
            // decode failure" rule from spec.md §4.E; `char::from_u32`
            // in the decoder already enforces it before constructing
            // this value, so this arm only re-validates defensively.
            Value::Char(c) => Ok(c),
            other => Err(shape_mismatch("char", &other)),
        }
    }
}

impl WitType for String {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::String
    }

    fn to_value(&self) -> Value {
        Value::String(self.clone())
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            Value::String(s) => Ok(s),
            other => Err(shape_mismatch("string", &other)),
        }
    }
}

impl<T: WitType> WitType for Vec<T> {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::list(T::wit_type_def())
    }

    fn to_value(&self) -> Value {
        Value::List(self.iter().map(WitType::to_value).collect())
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            Value::List(elements) => elements.into_iter().map(T::from_value).collect(),
            other => Err(shape_mismatch("list", &other)),
        }
    }
}

impl<T: WitType> WitType for Option<T> {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::option(T::wit_type_def())
    }

    fn to_value(&self) -> Value {
        Value::Option(self.as_ref().map(|v| Box::new(v.to_value())))
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            Value::Option(Some(boxed)) => Ok(Some(T::from_value(*boxed)?)),
            Value::Option(None) => Ok(None),
            other => Err(shape_mismatch("option", &other)),
        }
    }
}

impl<T: WitType, E: WitType> WitType for Result<T, E> {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::result(Some(T::wit_type_def()), Some(E::wit_type_def()))
    }

    fn to_value(&self) -> Value {
        match self {
            Ok(v) => Value::Result(Ok(Some(Box::new(v.to_value())))),
            Err(e) => Value::Result(Err(Some(Box::new(e.to_value())))),
        }
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            Value::Result(Ok(Some(boxed))) => Ok(Ok(T::from_value(*boxed)?)),
            Value::Result(Err(Some(boxed))) => Ok(Err(E::from_value(*boxed)?)),
            Value::Result(Ok(None)) | Value::Result(Err(None)) => Err(AbiError::invalid(
                "result<T, E> payload missing for a non-unit arm",
            )),
            other => Err(shape_mismatch("result", &other)),
        }
    }
}

macro_rules! impl_wit_type_for_tuple {
    ($( $name:ident ),+) => {
        impl<$( $name: WitType ),+> WitType for ($( $name, )+) {
            fn wit_type_def() -> WitTypeDef {
                WitTypeDef::Tuple(vec![$( $name::wit_type_def() ),+])
            }

            #[allow(non_snake_case)]
            fn to_value(&self) -> Value {
                let ($( $name, )+) = self;
                Value::Tuple(vec![$( $name.to_value() ),+])
            }

            #[allow(non_snake_case)]
            fn from_value(value: Value) -> AbiResult<Self> {
                match value {
                    Value::Tuple(elements) => {
                        let mut iter = elements.into_iter();
                        $(
                            let $name = $name::from_value(iter.next().ok_or_else(|| {
                                AbiError::invalid("tuple has fewer elements than expected")
                            })?)?;
                        )+
                        Ok(($( $name, )+))
                    }
                    other => Err(shape_mismatch("tuple", &other)),
                }
            }
        }
    };
}

impl_wit_type_for_tuple!(A, B);
impl_wit_type_for_tuple!(A, B, C);
impl_wit_type_for_tuple!(A, B, C, D);
impl_wit_type_for_tuple!(A, B, C, D, E);

/// A stable [`crate::wit_type::WitTypeDef::Resource`] handle, opaque to
/// the core (spec.md §9: "Resource-handle lifecycle across the host/guest
/// boundary ... is assumed handled by an external collaborator; the core
/// sees handles only as `u32`").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct ResourceHandle(pub u32);

impl WitType for ResourceHandle {
    fn wit_type_def() -> WitTypeDef {
        WitTypeDef::Resource
    }

    fn to_value(&self) -> Value {
        Value::Resource(self.0)
    }

    fn from_value(value: Value) -> AbiResult<Self> {
        match value {
            Value::Resource(handle) => Ok(ResourceHandle(handle)),
            other => Err(shape_mismatch("resource", &other)),
        }
    }
}

/// Derives [`WitType`] for a Rust struct as a WIT `record`. Fields are
/// listed in declaration order, which becomes the record's field order
/// (spec.md §9: "a derive-style mechanism for records").
///
/// ```ignore
/// struct Person { name: String, age: u32 }
/// wit_record!(Person { name: String, age: u32 });
/// ```
#[macro_export]
macro_rules! wit_record {
    ($struct_name:ident { $( $field:ident : $field_ty:ty ),+ $(,)? }) => {
        impl $crate::native::WitType for $struct_name {
            fn wit_type_def() -> $crate::wit_type::WitTypeDef {
                $crate::wit_type::WitTypeDef::Record(vec![
                    $(
                        $crate::wit_type::Field {
                            name: stringify!($field).replace('_', "-"),
                            ty: <$field_ty as $crate::native::WitType>::wit_type_def(),
                        },
                    )+
                ])
            }

            fn to_value(&self) -> $crate::value::Value {
                $crate::value::Value::Record(vec![
                    $( $crate::native::WitType::to_value(&self.$field), )+
                ])
            }

            fn from_value(value: $crate::value::Value) -> $crate::error::AbiResult<Self> {
                match value {
                    $crate::value::Value::Record(fields) => {
                        let mut iter = fields.into_iter();
                        $(
                            let $field = <$field_ty as $crate::native::WitType>::from_value(
                                iter.next().ok_or_else(|| {
                                    $crate::error::AbiError::invalid(
                                        "record has fewer fields than expected",
                                    )
                                })?,
                            )?;
                        )+
                        Ok($struct_name { $( $field, )+ })
                    }
                    other => Err($crate::error::AbiError::invalid(format!(
                        "expected a record value, found `{}`",
                        $crate::value::Value::shape_name(&other)
                    ))),
                }
            }
        }
    };
}

/// A thin combinator for WIT `variant`s (spec.md §9: "a small combinator
/// for variants"). The case list (used for `wit_type_def`'s discriminant
/// order) and the `to_value`/`from_value` bodies are supplied by the
/// caller as plain Rust, since a variant's cases can mix payload-bearing
/// and unit arms in ways a single token-matching macro captures poorly;
/// this combinator only removes the boilerplate around dispatching on
/// [`Value::Variant`] and assembling the [`WitTypeDef`].
///
/// ```ignore
/// enum Shape { Circle(f64), Empty }
/// wit_variant!(
///     Shape,
///     cases: [("circle", Some(f64::wit_type_def())), ("empty", None)],
///     to_value: |shape| match shape {
///         Shape::Circle(r) => (0, Some(r.to_value())),
///         Shape::Empty => (1, None),
///     },
///     from_value: |discriminant, payload| match discriminant {
///         0 => Ok(Shape::Circle(f64::from_value(*payload.ok_or_else(|| {
///             AbiError::invalid("circle expects a payload")
///         })?)?)),
///         1 => Ok(Shape::Empty),
///         other => Err(AbiError::invalid(format!("bad discriminant {other}"))),
///     },
/// );
/// ```
#[macro_export]
macro_rules! wit_variant {
    (
        $enum_name:ident,
        cases: [ $( ($case_name:expr, $case_payload:expr) ),+ $(,)? ],
        to_value: |$self_ident:ident| $to_value_body:expr,
        from_value: |$discriminant_ident:ident, $payload_ident:ident| $from_value_body:expr $(,)?
    ) => {
        impl $crate::native::WitType for $enum_name {
            fn wit_type_def() -> $crate::wit_type::WitTypeDef {
                $crate::wit_type::WitTypeDef::Variant(vec![
                    $(
                        $crate::wit_type::Case {
                            name: $case_name.to_string(),
                            payload: $case_payload,
                        },
                    )+
                ])
            }

            fn to_value(&self) -> $crate::value::Value {
                let $self_ident = self;
                let (discriminant, payload): (u32, Option<$crate::value::Value>) = $to_value_body;
                $crate::value::Value::Variant(discriminant, payload.map(Box::new))
            }

            fn from_value(value: $crate::value::Value) -> $crate::error::AbiResult<Self> {
                match value {
                    $crate::value::Value::Variant($discriminant_ident, boxed_payload) => {
                        let $payload_ident: Option<Box<$crate::value::Value>> = boxed_payload;
                        $from_value_body
                    }
                    other => Err($crate::error::AbiError::invalid(format!(
                        "expected a variant value, found `{}`",
                        $crate::value::Value::shape_name(&other)
                    ))),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip_through_value() {
        let original = 42u32;
        let value = original.to_value();
        assert_eq!(u32::from_value(value).unwrap(), original);
    }

    #[test]
    fn vec_round_trip_through_value() {
        let original = vec![1i32, 2, 3];
        let value = original.to_value();
        assert_eq!(Vec::<i32>::from_value(value).unwrap(), original);
    }

    #[test]
    fn option_round_trip_through_value() {
        let some: Option<u32> = Some(7);
        let none: Option<u32> = None;
        assert_eq!(Option::<u32>::from_value(some.to_value()).unwrap(), some);
        assert_eq!(Option::<u32>::from_value(none.to_value()).unwrap(), none);
    }

    #[test]
    fn result_round_trip_through_value() {
        let ok: Result<i32, String> = Ok(5);
        let err: Result<i32, String> = Err("bad".to_string());
        assert_eq!(Result::<i32, String>::from_value(ok.to_value()).unwrap(), ok);
        assert_eq!(
            Result::<i32, String>::from_value(err.to_value()).unwrap(),
            err
        );
    }

    #[test]
    fn wit_type_def_shapes_match_expectations() {
        assert_eq!(u32::wit_type_def(), WitTypeDef::U32);
        assert_eq!(String::wit_type_def(), WitTypeDef::String);
        assert_eq!(Vec::<u8>::wit_type_def(), WitTypeDef::list(WitTypeDef::U8));
    }

    struct Person {
        name: String,
        age: u32,
    }
    wit_record!(Person { name: String, age: u32 });

    #[test]
    fn record_macro_round_trips() {
        let person = Person {
            name: "Alice".to_string(),
            age: 30,
        };
        let value = person.to_value();
        let restored = Person::from_value(value).unwrap();
        assert_eq!(restored.name, "Alice");
        assert_eq!(restored.age, 30);
    }

    #[derive(Debug, PartialEq)]
    enum Shape {
        Circle(f64),
        Empty,
    }

    wit_variant!(
        Shape,
        cases: [("circle", Some(f64::wit_type_def())), ("empty", None)],
        to_value: |shape| match shape {
            Shape::Circle(radius) => (0, Some(radius.to_value())),
            Shape::Empty => (1, None),
        },
        from_value: |discriminant, payload| match discriminant {
            0 => {
                let boxed = payload.ok_or_else(|| AbiError::invalid("circle expects a payload"))?;
                Ok(Shape::Circle(f64::from_value(*boxed)?))
            }
            1 => Ok(Shape::Empty),
            other => Err(AbiError::invalid(format!("bad discriminant {other}"))),
        },
    );

    #[test]
    fn variant_macro_round_trips_each_case() {
        let circle = Shape::Circle(2.5);
        let value = circle.to_value();
        assert_eq!(Shape::from_value(value).unwrap(), Shape::Circle(2.5));

        let empty = Shape::Empty;
        assert_eq!(Shape::from_value(empty.to_value()).unwrap(), Shape::Empty);
    }

    #[test]
    fn variant_type_def_orders_cases_as_declared() {
        let def = Shape::wit_type_def();
        match def {
            WitTypeDef::Variant(cases) => {
                assert_eq!(cases[0].name, "circle");
                assert_eq!(cases[1].name, "empty");
                assert!(cases[1].payload.is_none());
            }
            other => panic!("expected a variant, got {other:?}"),
        }
    }
}
