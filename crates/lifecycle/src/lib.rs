pub mod align;
pub mod consistency;
pub mod error;
pub mod journal;
pub mod link;
pub mod manager;
pub mod redb_store;
pub mod repair;
pub mod schedule;
pub mod schema;
pub mod store;

pub use align::{AlignReference, AlignRequest, AlignSummary};
pub use consistency::{AuditReport, AuditScope, Finding, FindingKind};
pub use error::{LifecycleError, Result, StoreError};
pub use link::{LinkResult, SubmitRequest};
pub use manager::CheckInManager;
pub use repair::{RepairOutcome, RepairSummary};
pub use schedule::{CheckInWindow, EnrollmentParams};
pub use schema::{Frequency, Response, SeriesKey, Slot, SlotStatus};
