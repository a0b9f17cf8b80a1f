pub mod error;
pub mod types;

pub use error::{CacheError, Result};
pub use types::{CacheStatus, expiry_from_ttl, now_millis, remaining_ttl};
