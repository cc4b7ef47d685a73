//! The IPC core of the devmode control daemon: one bus connection, a peer
//! tracker resolving every remote client to an OS identity, privilege-gated
//! dispatch, and wakelock-pinned outbound calls.

pub mod bus;
pub mod clock;
pub mod config;
pub mod datapipe;
pub mod dispatch;
pub mod match_spec;
pub mod monitor;
pub mod name_tracker;
pub mod peer;
pub mod registry;
pub mod service;
pub mod services_file;
pub mod slots;
pub mod tracing_subscriber;
pub mod wakelock;
