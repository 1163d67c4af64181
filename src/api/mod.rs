pub mod facade;
pub mod routes;
pub mod server;
