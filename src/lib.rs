pub mod aggregator;
pub mod allocator;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod health;
pub mod manifest;
pub mod registry;
pub mod service;
pub mod shutdown;
pub mod stream;

pub use aggregator::{BatchResult, NodeUtilization};
pub use allocator::{Allocation, AllocationRequest, NodeAllocator, Strategy};
pub use batch::{BatchJobManager, BatchOptions, BatchState, BatchStatus};
pub use config::SchedulerConfig;
pub use dispatch::{Dispatcher, ItemOutcome, JobHandle, PollState, ProbeReport};
pub use error::{GridError, Result};
pub use health::HealthMonitor;
pub use manifest::{JobManifest, RetentionPolicy, WorkItem};
pub use registry::{ComputeNode, NodeCapability, NodeRegistry, NodeStatus, ResourceClass};
pub use service::{GridService, ServiceMetrics};
pub use stream::{StreamPipeline, StreamSummary};
