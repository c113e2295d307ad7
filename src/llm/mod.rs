mod client;
mod error;

pub use client::*;
pub use error::GatewayError;
