//! UUIDv7 helpers.
//!
//! All row ids are generated in process as UUIDv7, so ids sort by creation
//! time and the "stable tiebreak by identity" used when picking claim
//! candidates also favours older rows.

use uuid::Uuid;

/// Generate a new UUIDv7 identifier.
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}
