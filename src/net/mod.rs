//! Networking: packets, wire protocol, transports, connections, redundancy,
//! and the autohost side channel.

pub mod autohost;
pub mod connection;
pub mod packet;
pub mod plugin;
pub mod protocol;
pub mod redundancy;
