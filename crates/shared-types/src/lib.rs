//! # Shared Types - Core Domain Types for Inter-Module Communication
//!
//! Foundation crate for the Lattice communication core. Every other crate in
//! the workspace builds on the types defined here.
//!
//! ## Contents
//!
//! - [`module`]: module identity, metadata, and the in-process module registry
//! - [`auth`]: permissions, permission sets, and the auth-context contract
//! - [`message`]: the message envelope carried by the bus
//! - [`handler`]: the `Handler` capability trait for explicit registration
//! - [`errors`]: the shared error taxonomy
//!
//! ## Design Rules
//!
//! - Modules are addressed by [`ModuleId`] only; no direct references between
//!   module implementations.
//! - Handler registration is an explicit call, never implicit discovery.
//! - The registry is the sole source of truth for "is this module live".

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod auth;
pub mod errors;
pub mod handler;
pub mod message;
pub mod module;

// Re-export main types
pub use auth::{AuthContext, AuthContextProvider, Permission, PermissionSet, Principal};
pub use errors::CommsError;
pub use handler::{DynHandler, Handler, HandlerError};
pub use message::{Message, MessagePattern, MessagePriority, MessageStatus};
pub use module::{ModuleHealth, ModuleId, ModuleInfo, ModuleRegistry};
