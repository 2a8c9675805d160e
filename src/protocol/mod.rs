//! Protocol Module - JSON-Frames über den Control-Channel
//!
//! Dieses Modul enthält:
//! - Die ausgehenden und eingehenden Frame-Typen
//! - Den zustandslosen Codec zwischen Wire-JSON und Frame-Typen
//!

mod codec;
mod messages;

pub use codec::{decode, encode, DecodeError, EncodeError};
pub use messages::*;
