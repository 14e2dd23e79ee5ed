pub mod api;
pub mod cli;
pub mod cluster;
pub mod error;
pub mod node;
pub mod observability;
pub mod settings;
pub mod transport;
