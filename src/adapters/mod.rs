//! Adapters - Port Implementations
//!
//! Concrete implementations of the domain ports: ssh for real machines, an
//! in-memory spare inventory, a JSON file sink, and a simulated fleet used
//! by the test suites.

pub mod json_sink;
pub mod memory_spares;
pub mod sim;
pub mod ssh_shell;
