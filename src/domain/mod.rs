//! Domain Layer
//!
//! Entities and outbound ports for the topology orchestrator. Everything in
//! here is transport-agnostic; concrete shells, SQL drivers, and inventory
//! backends live under `adapters`.

pub mod entities;
pub mod ports;
