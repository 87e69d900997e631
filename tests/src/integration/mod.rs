//! Cross-crate integration scenarios, driven through the facade.

pub mod discovery;
pub mod messaging;
pub mod workflows;
