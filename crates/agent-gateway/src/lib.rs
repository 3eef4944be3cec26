//! Library surface for `ag-gateway`, split out from the binary so
//! integration tests can drive the HTTP router directly with
//! `tower::ServiceExt::oneshot` instead of a real listening socket.

pub mod api;
pub mod auth;
pub mod bootstrap;
pub mod cli;
pub mod maintainer;
pub mod session_lock;
pub mod session_manager;
pub mod state;
pub mod stream_translator;
