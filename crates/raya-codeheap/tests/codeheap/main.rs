//! Integration tests for the AOT code heap
//!
//! Each module drives the public API against the fixture blob from
//! `harness` and a fake engine runtime.

mod harness;
mod bounds;
mod linkage;
mod registry;
