//! Program IR and the engine contract fusion definitions lower to.
//!
//! [`spec`] holds the declarative SSA program format, its text rendering and the
//! [`FusionBackend`](spec::FusionBackend) trait engines implement; [`hashing`] provides the
//! stable fingerprints engines use to key compiled-plan caches.

pub mod hashing;
pub mod spec;
