//! Utility functions for ids, timestamps and artifact file trees.

pub mod files;
mod ids;
pub mod timestamps;

pub use ids::{generate_uuid_v7, short_id};
pub use timestamps::{elapsed_ms, iso_timestamp, now_utc, Timestamp};
