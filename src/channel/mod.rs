pub mod channel;
pub mod config;
pub mod environment;
pub mod link_state;
pub mod link_url;
pub mod pinger;
pub mod reader;
pub mod response;
pub mod transport;
pub mod wire;
