//! Basic block versioning: contexts, the block graph, version tables and invalidation state.

pub mod block;
pub mod context;
pub mod invalidate;
pub mod versions;

pub use block::{Block, BlockId, BlockRef, BlockStatus, Branch, BranchKind, BranchRef, BranchShape, Graph};
pub use context::{Context, InsnOpnd, TempMapping, Type, TypeDiff};
pub use invalidate::{InvalidationState, PatchRecord};
pub use versions::VersionTable;
