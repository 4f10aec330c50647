// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Unit tests for the PostgreSQL role operator
//!
//! This module contains unit tests for:
//! - Validation logic (identifier lengths, duplicate privileges, import
//!   secret shape, bouncer availability)
//! - Work-secret identity planning (creation, rotation, rotation halt,
//!   provided-mode mirroring)
//! - Output secret data construction (URIs, replicas, bouncer selection)

#[path = "../common/mod.rs"]
mod common;

mod output_secrets;
mod validation;
mod work_secret;
