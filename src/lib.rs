//! pvaccess - structured process-value access over TCP
//!
//! A client and server for a binary request protocol modeled on EPICS
//! pvAccess: connections shared by reference-counted owners and watched for
//! liveness, a per-connection type cache, differential encoding of structured
//! values, and the put-get request state machine.

pub mod config;
pub mod handlers;
pub mod network;
pub mod protocol;
pub mod provider;
pub mod pvdata;
