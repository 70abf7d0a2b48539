//! Zentinel Map Local Agent
//!
//! An agent for Zentinel that replaces responses of chosen URLs with the
//! content of local files. Handy for pinning API fixtures, testing front-end
//! changes against edited assets, and reproducing bugs offline.
//!
//! # Features
//!
//! - **URL Matching**: exact, substring, wildcard and regex rules with priorities
//! - **Safe Substitution**: recomputed `Content-Length`, no stale framing or validators
//! - **File Cache**: mtime/TTL invalidation with single-flight reads
//! - **Hot Reload**: rule sets are swapped atomically; a bad reload changes nothing
//! - **Failure Containment**: any failure degrades to passthrough (or a block page)
//!
//! # Example Configuration
//!
//! ```yaml
//! settings:
//!   root: ./fixtures
//! rules:
//!   - id: users
//!     pattern: https://api.example.com/v1/users
//!     local_path: users.json
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod exchange;
pub mod hook;
pub mod matcher;
pub mod resolver;
pub mod rules;
pub mod substitute;

pub use agent::MapLocalAgent;
pub use config::MapLocalConfig;
pub use error::{ConfigError, FileError};
pub use exchange::{Exchange, Headers, HttpResponse};
pub use hook::{Action, Interceptor};
