//! redb table definitions for the WaterHack state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Fields keyed by `{field_id}`.
pub const FIELDS: TableDefinition<&str, &[u8]> = TableDefinition::new("fields");

/// Demands keyed by the zero-padded demand id.
pub const DEMANDS: TableDefinition<&str, &[u8]> = TableDefinition::new("demands");

/// Delivery audit records keyed by `{demand_key}:{seq}`.
pub const DELIVERIES: TableDefinition<&str, &[u8]> = TableDefinition::new("deliveries");
