//! Low-level primitives the reclamation engine is built on.
//!
//! Includes the collaborator contracts (page-mapping layer, compressor,
//! external pager), their in-memory simulations, and the wake/backoff
//! primitives shared by the worker threads.

/// Wake channels and lock retry policy.
pub mod concurrency;

/// Contracts with the hardware mapping layer, the compression codec and
/// the external pager.
pub mod hal;

/// In-memory implementations of the collaborator contracts.
pub mod sim;
