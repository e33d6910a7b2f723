pub mod call;
pub mod config;
pub mod error;
pub mod model;
pub mod server;
pub mod transform;
pub mod util;
