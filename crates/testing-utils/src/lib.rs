//! # Render Farm Testing Utils
//!
//! Shared testing utilities for the render farm manager.
//!
//! ## Features
//!
//! - **In-memory store**: one `InMemoryStore` implementing every repository trait
//! - **Recording collaborators**: change broadcaster and task-log sink that remember what they got
//! - **Controllable clock**: `MockClock` for timeout and sleep-schedule tests
//! - **Test Data Builders**: builders for jobs, tasks and workers
//!
//! ## Usage
//!
//! ```toml
//! [dev-dependencies]
//! renderfarm-testing-utils = { path = "../testing-utils" }
//! ```
//!
//! ```rust,ignore
//! use renderfarm_testing_utils::{InMemoryStore, JobBuilder};
//! let store = std::sync::Arc::new(InMemoryStore::new());
//! let repos = renderfarm_core::Repositories::from_store(store.clone());
//! ```

pub mod builders;
pub mod mocks;

pub use builders::*;
pub use mocks::*;
