pub mod cli;
pub mod proxy;
pub mod socks;
pub mod telemetry;
pub mod trace;
pub mod udp;
pub mod upstream;
