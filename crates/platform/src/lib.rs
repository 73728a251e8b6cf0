//! # Keel Platform
//!
//! Core types and utilities shared across the Keel SSH server:
//!
//! - Unified error types (`KeelError`, `KeelResult`)
//! - Single-shot completion cells (`Completion`) with `verify(timeout)`
//! - Composable graceful close (`Closer` builder)
//!
//! # Examples
//!
//! ```
//! use keel_platform::{KeelError, KeelResult};
//!
//! fn example_function() -> KeelResult<String> {
//!     Ok("Hello, Keel!".to_string())
//! }
//!
//! # fn main() -> KeelResult<()> {
//! let result = example_function()?;
//! assert_eq!(result, "Hello, Keel!");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;
pub mod future;

pub use error::{KeelError, KeelResult};
pub use future::{CloseFn, CloseFuture, Closer, CloserBuilder, Completion};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
