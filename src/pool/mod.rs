//! Bounded-concurrency worker pool
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────────────────┐
//!            │   Producer thread    │
//!            │ (document reader or  │
//!            │  query iterator)     │
//!            └──────────┬───────────┘
//!                       │ add_work / join
//!                       ▼
//!            ┌──────────────────────┐
//!            │      WorkQueue       │
//!            │  bounded FIFO, one   │
//!            │  mutex, 4 conditions │
//!            └──────────┬───────────┘
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!     ┌─────────┐  ┌─────────┐  ┌─────────┐
//!     │Worker 1 │  │Worker 2 │  │Worker N │   N in [core, maximum]
//!     │ handler │  │ handler │  │ handler │
//!     └─────────┘  └─────────┘  └─────────┘
//! ```

pub mod executor;
pub mod queue;
pub mod worker;

pub use executor::{RunState, WorkerPool};
pub use queue::{QueueStats, WorkQueue};
pub use worker::{WorkHandler, WorkerFactory};
