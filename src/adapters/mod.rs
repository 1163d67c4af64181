pub mod docker;
pub mod mock;
pub mod ports;
pub mod registry;
pub mod runtime;
