//! Shared types for the media session bridge
//!
//! - `models`: sessions, playback state codes and the records sent downstream
//! - `codec`: artwork and queue-entry encodings
//! - `traits`: platform session primitives the engine consumes
//! - `error`: platform, codec and command-boundary errors

pub mod codec;
pub mod error;
pub mod models;
pub mod traits;

pub use codec::*;
pub use error::*;
pub use models::*;
pub use traits::*;
