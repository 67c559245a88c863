//! # rkv-engine
//!
//! The in-process storage engine: the concurrent Sharded Map, the fixed-fan
//! -out Lock Map, the five value-entity shapes, the command dispatcher
//! (`DataEngine`), the append-only file writer/loader, and the periodic
//! expirer. Everything in this crate is single-node; cross-node routing
//! lives in `rkv-cluster`.

pub mod aof;
pub mod engine;
pub mod expire;
pub mod lock_map;
pub mod sharded_map;
pub mod value;

pub use engine::{next_conn_id, AofSink, DataEngine, KeySnapshot};
pub use expire::Expirer;
pub use lock_map::LockMap;
pub use sharded_map::ShardedMap;
pub use value::Entity;
