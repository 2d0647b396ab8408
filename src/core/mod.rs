//! Core building blocks shared by every layer: errors, configuration, the
//! clock, request identity and the application context.

pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
