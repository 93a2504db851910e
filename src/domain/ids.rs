//! Identifiers for records that exist only locally until the server confirms
//! them.
//!
//! Optimistic creates insert a record whose id is `temp-<uuid>`. Once the
//! server answers, the record is replaced by the canonical one carrying the
//! server-assigned id.

use uuid::Uuid;

pub const TEMP_ID_PREFIX: &str = "temp-";

/// Fresh temporary id for an optimistic insert.
pub fn temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::new_v4())
}

/// True for ids produced by [`temp_id`].
pub fn is_temporary(id: &str) -> bool {
    id.strip_prefix(TEMP_ID_PREFIX)
        .is_some_and(|rest| Uuid::parse_str(rest).is_ok())
}
