//! Durable key-value persistence + remote API client for fieldreg.

pub mod http;
pub mod store;

pub use http::{
    classify_reqwest_error, classify_status, ApiClient, ApiConfig, GetRetryPolicy, Method,
    RemoteError, RetryDisposition,
};
pub use store::{load_json, save_json, FileStore, KeyValueStore, MemoryStore, StoreError};

pub const CRATE_NAME: &str = "fieldreg-storage";

/// Namespaced keys shared by every consumer of the durable store.
pub mod keys {
    pub const QUEUE_ITEMS: &str = "sync_queue:items";
    pub const WEIGHTING_PROFILE: &str = "scoring:weighting_profile";

    pub fn assessment(person_id: &str) -> String {
        format!("assessment:{person_id}")
    }
}
