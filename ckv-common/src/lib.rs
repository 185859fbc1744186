// ckv-common - Shared types and error definitions for the ClusterKV client
//
// This crate defines the value types exchanged between the routing layer and
// its collaborators, the error taxonomy, and the marshaller boundary.

pub mod error;
pub mod marshal;
pub mod types;

// Re-export for convenience
pub use error::*;
pub use marshal::*;
pub use types::*;
