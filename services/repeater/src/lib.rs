// repeater: edge fan-out for the event fabric.
//
// Consumes a hub over one messenger connection and re-emits each event to
// sibling room devices (pumping stations) or HTTP endpoints, per the send
// list built from the device registry.

pub mod config;
pub mod http_buffer;
pub mod repeater;
pub mod send_list;
pub mod server;
pub mod station;
pub mod ws_compat;
