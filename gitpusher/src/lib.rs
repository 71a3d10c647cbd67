pub mod attachments;
pub mod client;
pub mod compose;
pub mod context;
pub mod error;
pub mod linker;
pub mod mapper;
pub mod pacing;
pub mod upsert;

pub use crate::client::{
    ContentStore, IssuePatch, IssueState, IssueTracker, OctocrabContentStore, OctocrabTracker,
    RateBudget, RemoteIssue,
};
pub use crate::context::PushContext;
pub use crate::error::{PushError, Result};
pub use crate::linker::{link_all, LinkReport};
pub use crate::mapper::{build_map, ReconciliationMap};
pub use crate::pacing::{PushSettings, RetryPolicy};
pub use crate::upsert::{push_all, upsert, PushReport};
