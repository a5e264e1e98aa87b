//! Request Entrypoints (C9): the cross-token retry loop and per-surface
//! orchestration sitting between the HTTP layer (`gateway`) and the
//! reverse-client/stream-processor/token-pool collaborators (C3-C5).

pub mod admin;
pub mod chat;
pub mod common;
pub mod image;
pub mod image_edit;
pub mod video;
