//! Gateway namespace: the axum HTTP surface (spec.md §6.1) wired to
//! [`crate::app::AppState`] and the `entrypoints` handlers.

mod http;

pub use http::{router, run_http};
