//! Client for a Vaillant heating controller reached through the ebusd gateway daemon.
//!
//! [`client::EbusClient`] reads a cached snapshot of hot water, status and zone values and
//! starts or stops quick modes (hot-water boost, zone quick veto), optionally picked by a
//! [`models::ebus::Strategy`].

pub mod models {
    pub mod ebus;
}

pub mod arbiter;
pub mod cache;
pub mod client;
pub mod config;
pub mod session;
pub mod simulator;
pub mod services {
    pub mod watch;
}
