//! Backend implementations for the remote-store contract.
//!
//! Concrete network drivers (Redis, SQL, object stores) live outside this
//! crate and plug in through [`RemoteBackend`](crate::traits::RemoteBackend).
//! The in-memory backend here is the reference implementation: it exercises
//! the full contract (TTLs, tag sets, scanning, atomic tagging) and backs the
//! integration tests, where sharing one instance across cache managers
//! emulates a shared distributed store.

mod memory_remote;

pub use memory_remote::MemoryRemoteBackend;
