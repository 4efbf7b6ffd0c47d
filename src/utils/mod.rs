//! Cross-cutting helpers.

pub mod aligned;
pub mod log;
pub mod test_utils;
