//! Cont daemon: local container-control plane.
//!
//! Serves a line protocol on a Unix domain socket:
//! - `start <id>` acknowledges and makes the container's image available
//!   locally, pulling it into the content store if needed
//! - `stop <id>` acknowledges
//! - anything else is echoed back
//!
//! Container processes are never created or torn down here.

pub mod context;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use context::DaemonContext;
pub use handler::CommandHandler;
pub use protocol::{Command, Response};
pub use server::{Connection, ControlServer};
