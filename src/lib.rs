//! `witty-abi`: a host-side Canonical ABI transcoder and Asyncify
//! cooperative scheduler for the WebAssembly Component Model.
//!
//! This crate lifts and lowers typed values across the host/guest
//! boundary and drives suspending host operations through a guest's
//! Asyncify-instrumented exports. It does not parse or validate component
//! binaries, link modules, or embed a WASM engine — those are the
//! responsibility of the [`engine`] traits' implementor.

pub mod allocator;
pub mod asyncify;
pub mod canon;
pub mod compiler;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod encode;
pub mod engine;
pub mod error;
pub mod flat;
pub mod flatten;
pub mod host_binder;
pub mod layout;
pub mod memory;
pub mod names;
pub mod native;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod value;
pub mod wit_type;

pub use error::{AbiError, AbiResult, ErrorKind};
pub use native::WitType;
pub use value::Value;
pub use wit_type::WitTypeDef;
