//! Outbound Ports
//!
//! Interfaces to the four external collaborators the core requires but does
//! not implement: the remote shell transport, the SQL query interface, the
//! spare-machine allocator, and the configuration sink.

mod config_sink;
mod query_executor;
mod remote_shell;
mod spare_allocator;

pub use config_sink::ConfigSink;
pub use query_executor::{QueryExecutor, Row, SqlTarget};
pub use remote_shell::{RemoteShell, ShellSession};
pub use spare_allocator::SpareAllocator;
