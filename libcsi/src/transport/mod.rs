//! QUIC transport layer for CSI messages.
//!
//! This module provides [`client::CsiClient`] and [`server::CsiServer`] that
//! communicate [`CsiMessage`](crate::message::CsiMessage) values over QUIC
//! bi-directional streams using `quinn`.

pub mod client;
pub mod server;
