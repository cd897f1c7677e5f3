//! wsengine demo crate
//!
//! ## Architecture
//!
//! - **bin_common**: Common utilities for binary executables (CLI, logging, runners)
//! - **wsengine**: WebSocket session engine (re-exported from workspace)
//!
//! ## Usage in Binaries
//!
//! ```rust
//! use wsengine_demo::bin_common::{load_config_from_env, ConfigType};
//! use wsengine_demo::wsengine::ClientConfig;
//! ```

// Re-export workspace libraries for convenience
pub use wsengine;

// Binary common utilities
pub mod bin_common {
    //! Common utilities for binary executables

    pub mod cli;
    pub mod logging;
    pub mod runner;

    pub use cli::{load_client_config, load_config_from_env, parse_args, ConfigType};
    pub use logging::init_tracing;
    pub use runner::{BinaryRunner, RunConfig};
}
