//! waterhack-state: embedded state store for WaterHack.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for fields, water demands and delivery audit records.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Demand keys are zero-padded ids so a table scan yields submission order;
//! delivery records use `{demand_key}:{seq}` for prefix scans per demand.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
