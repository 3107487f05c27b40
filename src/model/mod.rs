//! Model sharding: layer-range shards, placement plans, and the local
//! registry of plans available for pipeline inference.

pub mod planner;
pub mod shard;

pub use planner::{create_sharding_plan, optimize_shard_placement, shard_checksum};
pub use shard::{ModelShard, ShardPlan, ShardStore};
