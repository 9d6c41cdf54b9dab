//! StagelinQ discovery, framed connections, and audibility inference.
//!
//! This crate is organized leaf-first: `codec` has no dependency on the
//! others, `discovery` and `connection` depend only on `codec`, `state`
//! depends on `connection`, and `audibility` depends only on `codec`'s
//! `State` type so it can run disconnected from any live device (useful in
//! tests and for replaying captured telemetry).

pub mod audibility;
pub mod codec;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod state;

pub use audibility::{AudibilitySelector, MixMode, PlayingTrack};
pub use codec::{State, StateValue, Token};
pub use connection::{Connection, FramedChannel, Service};
pub use discovery::{Device, DeviceEvent, DeviceState, Discovery, DiscoveryConfig};
pub use error::{Error, Result};
pub use state::{BeatRecord, BeatStream, StateStream};
