//! In-line reverse proxy protecting an upstream HTTP service from
//! volumetric and behavioral DDoS attacks.
//!
//! Every inbound request is resolved to its true client, recorded in a
//! sliding activity window, turned into a feature vector, classified by a
//! hybrid of volumetric heuristics and a cached model, and then either
//! denied with a mitigation response or forwarded upstream with the
//! response streamed back.

pub mod admin;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod mitigation;
pub mod model;
pub mod prediction;
pub mod proxy;
pub mod resolver;
pub mod telemetry;
pub mod types;
pub mod upstream;
pub mod window;

pub use error::{GuardError, Result};
