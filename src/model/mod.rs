//! Data models shared by the two demo flows
//!
//! Frames for the transform pipeline, session descriptions and codec
//! capabilities for call negotiation.

pub mod codec;
pub mod description;
pub mod frame;
