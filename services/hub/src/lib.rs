// hub: central routing core of the event fabric.
//
// Peers (messengers, repeaters, other hubs) connect over websockets; the
// nexus actor fans each event out by room subscription and source tier.

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod interconnect;
pub mod nexus;
pub mod server;
pub mod status;
