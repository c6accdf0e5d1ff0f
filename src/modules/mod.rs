//! Cross-cutting services module
//!
//! Shared infrastructure leaned on by the orchestrator: proxy pool health,
//! lifecycle events, and job snapshot persistence.

pub mod events;
pub mod proxy;
pub mod store;

// Re-export commonly used types
pub use events::{
    ChallengeObservedEvent, EventDispatcher, EventHandler, JobFinishedEvent, LoggingHandler,
    MirrorEvent, MirrorPhase, PageCapturedEvent, PageFailedEvent, PageStartedEvent,
    ProgressChannelHandler, ProgressEvent,
};
pub use proxy::{
    EndpointStats, ProxyConfig, ProxyHealthReport, ProxyManager, ProxySelection, RotationStrategy,
};
pub use store::{JobStore, StoreError};
