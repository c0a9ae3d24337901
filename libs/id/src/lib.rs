//! # lbaas-id
//!
//! Typed identifiers for the load-balancer driver.
//!
//! The orchestration platform owns tenant and resource identifiers, and the
//! device registry owns device names. Neither follows a format we control, so
//! IDs here are opaque strings with a small validation contract:
//!
//! - not empty
//! - at most [`MAX_ID_LEN`] bytes
//! - no whitespace or control characters
//!
//! Wrapping them in distinct types keeps a tenant id from being passed where a
//! device name is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Maximum accepted length of an ID, in bytes.
pub const MAX_ID_LEN: usize = 255;

/// Validate a raw ID string.
pub fn validate(s: &str) -> Result<(), IdError> {
    if s.is_empty() {
        return Err(IdError::Empty);
    }
    if s.len() > MAX_ID_LEN {
        return Err(IdError::TooLong {
            len: s.len(),
            max: MAX_ID_LEN,
        });
    }
    if let Some((index, ch)) = s
        .char_indices()
        .find(|(_, c)| c.is_whitespace() || c.is_control())
    {
        return Err(IdError::InvalidCharacter { ch, index });
    }
    Ok(())
}
