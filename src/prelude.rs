//! Convenient re-exports for views that only issue requests.
pub use crate::{
    client::{ApiClient, ApiClientBuilder},
    config::ClientConfig,
    error::{ErrorClass, RequestError},
    governor::{CallResult, RequestGovernor},
    scope::{RequestOptions, RequestScope, RequestState, ScopeOptions},
};
