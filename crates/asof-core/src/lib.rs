//! Core types and trait definitions for the as-of Lab.
//!
//! This crate is free of HTTP and database dependencies. Everything that
//! decides a hash, a feature value or a score lives here and is pure.

// Native `async fn`-style traits; suppress the advisory lint about `Send`
// bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod adapter;
pub mod audit;
pub mod canonical;
pub mod clock;
pub mod error;
pub mod evaluation;
pub mod feature;
pub mod market;
pub mod model;
pub mod prediction;
pub mod run;
pub mod snapshot;
pub mod store;
pub mod universe;

pub use error::{Error, Result};
