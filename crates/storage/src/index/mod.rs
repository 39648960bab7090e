#![forbid(unsafe_code)]

//! In-memory caches kept beside each queue's block. They are rebuilt from
//! the block on mount and only ever changed after a commit.

mod affinity;
mod status;
mod tags;
mod timeline;

pub use affinity::AffinityRegistry;
pub use status::StatusIndex;
pub use tags::TagIndex;
pub use timeline::ExecutionTimeline;
