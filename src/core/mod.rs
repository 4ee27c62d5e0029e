//! Ambient infrastructure shared by every other module: the error type, configuration and
//! statistics.

pub mod error;
pub mod options;
pub mod stats;

pub use error::{JitError, JitResult};
pub use options::{JitOptions, TargetArch};
pub use stats::{Counter, JitStats, RuntimeCounters};
