/*!
 * Core Module
 * Fundamental sandbox error handling, constants and serde helpers
 */

pub mod errors;
pub mod limits;
pub mod serde;

// Re-export for convenience
pub use errors::*;
