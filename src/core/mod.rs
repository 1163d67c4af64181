pub mod controller;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod pool;
pub mod state;
pub mod trigger;
