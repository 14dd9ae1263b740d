//! # touch3d
//!
//! Engine runtime: the core allocators and worker pool plus the process
//! setup around them.
//!
//! ```rust,ignore
//! use touch3d::logging::{init_logging, LogConfig};
//! use touch3d::{CoreConfig, CoreContext};
//!
//! init_logging(LogConfig::default())?;
//! let core = CoreContext::new(CoreConfig::default())?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]

pub mod logging;

pub use touch3d_core::*;
