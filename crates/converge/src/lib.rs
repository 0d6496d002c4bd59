//! Keel converge engine: builds a desired child from a typed request, compares it with the live
//! object field by field, and creates, updates or deletes through a [`keel_store::StoreClient`].

#![forbid(unsafe_code)]

pub mod compare;
pub mod engine;
pub mod mutation;
pub mod owner;
pub mod request;

pub use compare::{ComparatorTable, FieldToCompare};
pub use engine::{ConvergeError, ConvergeOptions, Converger, DriftPolicy, MutationPolicy};
pub use mutation::{HookFailure, Mutation, MutationError, MutationPipeline};
pub use owner::{attach, is_owned_by, OwnerError};
pub use request::{Built, ResourceRequest};

pub mod prelude {
    pub use super::{ComparatorTable, Converger, DriftPolicy, FieldToCompare, Mutation, ResourceRequest};
    pub use keel_core::prelude::*;
}
