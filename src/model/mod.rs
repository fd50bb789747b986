//! Data models for bridged sessions
//!
//! This module contains the plain data passed between the signaling channel,
//! the peer connection and the local relay.

pub mod description;
pub mod descriptor;
pub mod packet;
pub mod tracks;
