//! fleetd: keeps pools of containerised game servers sized to player demand
//! and registered with the routing proxy.

pub mod adapters;
pub mod api;
pub mod config;
pub mod core;
pub mod telemetry;
