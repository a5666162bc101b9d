//! Identifier helpers.

use uuid::Uuid;

/// Generates a new UUID v7 (time-ordered).
///
/// Run and artifact ids use v7 so that listing them in id order roughly
/// follows creation order.
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Returns the first eight hex characters of an id, for log lines.
#[must_use]
pub fn short_id(id: &Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}
