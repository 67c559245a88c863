//! # rkv-cluster
//!
//! Cross-node routing for a multi-node deployment: the consistent hash
//! ring, the two-phase `DEL` coordinator, the snowflake-style transaction id
//! generator, and the `ClusterRouter` that ties them together behind the
//! same `exec(args) -> reply` shape the single-node engine exposes.
//! Everything in `rkv-engine` remains single-node; this crate is the only
//! one that knows about peers.

mod idgen;
mod ring;
mod router;

pub use idgen::IdGenerator;
pub use ring::HashRing;
pub use router::ClusterRouter;
