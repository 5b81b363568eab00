pub mod client;
pub mod cmdline;
pub mod commands;
pub mod config;
pub mod controller;
pub mod error;
pub mod messages;
pub mod network;
pub mod nvs;
pub mod ota;
pub mod releases;

pub mod prelude {
    pub use crate::{
        client::*, config::*, controller::*, error::*, messages::*, ota::*,
    };
}
