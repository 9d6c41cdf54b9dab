//! Unified asynchronous data cache: storage, rate limiting, HTTP fetching,
//! a background worker pool, and a thin provider facade.
//!
//! Modules are organized leaf-first: `storage` has no dependency on the
//! others; `ratelimit` is standalone; `fetch` composes both; `worker` and
//! `provider` sit on top of `fetch`.

pub mod error;
pub mod fetch;
pub mod provider;
pub mod ratelimit;
pub mod storage;
pub mod worker;

pub use error::{Error, Result};
pub use fetch::{FetchOutcome, Fetcher};
pub use provider::ProviderFacade;
pub use ratelimit::RateLimiterManager;
pub use storage::{DataValue, PendingRequest, RequestStatus, RetrievedValue, Storage};
pub use worker::{WorkerConfig, WorkerManager};
