pub mod address;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod intenc;
pub mod line;
pub mod mux;
pub mod relay;
pub mod rewrite;
pub mod server;
pub mod transport;
