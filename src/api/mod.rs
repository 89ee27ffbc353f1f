//! HTTP/JSON Surface
//!
//! Axum handlers exposing the store and the control surface. The route
//! table lives in `main.rs`; handlers receive their dependencies through
//! `Extension` layers. Validation happens here (the store never sees an
//! out-of-range extern_id or payload) and every successful mutation is
//! followed by the matching cluster broadcast.

pub mod handlers;
