//! Centralized error handling for the scale store
//!
//! This module provides the error taxonomy shared by the scale index, the
//! persistence substrates and the scaling function seam.
//!
//! # Error Categories
//!
//! - **Generation Errors**: the scaling function rejected its input
//! - **Persistence Errors**: the blob substrate failed or returned corrupt data
//! - **Duplicate Parameters**: index invariant violation, recovered by the store
//!
//! A missing scale is not an error: lookups return `Ok(None)`.
//!
//! # Usage
//!
//! ```rust
//! use scale_store::errors::{ScaleError, ScaleResult};
//!
//! fn example_function() -> ScaleResult<u32> {
//!     Err(ScaleError::configuration("field name must not be empty"))
//! }
//! ```

pub mod types;

pub use types::*;

/// Convenience type alias for Results using ScaleError
pub type ScaleResult<T> = Result<T, ScaleError>;

/// Convenience type alias for substrate Results
pub type PersistenceResult<T> = Result<T, PersistenceError>;
