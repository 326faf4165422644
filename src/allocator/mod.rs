//! Global id and timestamp allocation
//!
//! Both allocators hand out values from a locally held window and only touch
//! the catalog store when the window runs low, so the hot path is lock-only.
//! The persisted counter always records the reserved maximum: after a
//! restart the next window starts strictly above everything a previous
//! incarnation could have handed out.

mod id;
mod tso;

pub use id::GlobalIdAllocator;
pub use tso::{compose_ts, logical_part, physical_ms, TimestampOracle};
