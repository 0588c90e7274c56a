//! Execution: hybrid exact + semantic retrieval and the result set it yields.

pub mod hybrid;
pub mod result;

pub use hybrid::{merge_rows, HybridExecutor};
pub use result::{EntityRow, Provenance, ResultRow, ResultSet};
