//! Persistence and outbound HTTP for LKF Rental Watch: the SQLite entity store, the
//! attachment directory and the lane-limited fetcher shared by every remote service.

mod attachments;
mod entity;
mod http;

pub use attachments::{AttachmentStore, StoredAttachment};
pub use entity::{EntityStore, StoreError, StoreTransaction};
pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RateLimiter,
    RetryPolicy,
};

pub const CRATE_NAME: &str = "lkf-storage";
