//! Delta chain maintenance: image consolidation and chain health.

pub mod health;
pub mod merge;

pub use health::{
    build_child_index, sr_unhealthy_chains, srs_unhealthy_chains, unhealthy_chain_length, ChildIndex,
    VdiCatalog, VdiInventory, VdiRecord,
};
pub use merge::{ChainMerger, MergeSummary};
