//! # beacon-core
//!
//! Shared runtime state and inter-node routing for the Beacon push
//! server.
//!
//! - **Registry** - the process-wide table mapping device IDs to the
//!   session worker currently holding their socket
//! - **Router** - point-to-point fan-out that delivers an update to
//!   whichever peer node owns the target device's connection
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Endpoint   │────▶│  Registry   │────▶│SessionWorker │
//! └──────────────┘     └─────────────┘     └──────────────┘
//!        │ miss
//!        ▼
//! ┌──────────────┐     ┌─────────────┐
//! │    Router    │────▶│ peer nodes  │
//! └──────────────┘     └─────────────┘
//! ```

pub mod registry;
pub mod router;

pub use registry::{WorkerEvent, WorkerHandle, WorkerRegistry};
pub use router::{Locator, RouteRequest, Router, RouterConfig, RouterError, StaticLocator};
