pub mod hub;
mod web;

pub use hub::{HubConfig, HubError, PeerInfo, RelayHub};
