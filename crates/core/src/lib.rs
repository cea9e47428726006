//! Domain foundation shared by the seatflow crates.
//!
//! This crate contains **pure domain** primitives shared by the license
//! inventory, the allocation optimizer and the provisioning pipeline
//! (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use entity::Entity;
pub use error::DomainError;
pub use id::{ActionId, ProductId, UserId};
pub use money::Money;
pub use value_object::ValueObject;
