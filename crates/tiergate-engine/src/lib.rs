pub mod batch;
pub mod cache;
pub mod clock;
pub mod gate;
pub mod resolver;
pub mod sync;

pub use batch::{BatchConfig, BatchError, BatchLoader, BatchWindow};
pub use cache::{CacheConfig, CacheError, CacheKey, CacheStats, TierCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use gate::AccessGate;
pub use resolver::{
    standard_resolver, BillingStage, IdentityStage, StoreBatchLoader, StoreStage, TierResolver,
};
pub use sync::{
    SubscriptionEvent, SubscriptionEventKind, SyncError, SyncOutcome, TierSynchronizer,
};
