pub mod calendar;
pub mod events;
pub mod queries;
pub mod registry;
pub mod scheduler;
pub mod types;

pub use events::{NoopHooks, SchedulerHooks};
pub use queries::Queries;
pub use registry::{Context, ContextSettings, DataCodec, DefaultCodec, Registry, RetryConfig, default_registry};
pub use scheduler::Scheduler;
pub use types::{
    AllocateDates, AllocateOptions, ChangeAllocationAttrs, RemoveAllocationTarget, RemoveUnusedFilter, ReserveInput,
    ReserveTarget,
};
