//! The dripfeed payloads
//!
//! This library supports payload generation for the dripfeed project. Today
//! the only wire format spoken by the datastore's data endpoint is SenML, so
//! the only serializer here is [`senml::SenMl`].

#![deny(clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::io::{self, Write};

use rand::Rng;

pub use senml::SenMl;

pub mod senml;

/// Errors related to serialization
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Json payload could not be encoded
    #[error("Json payload could not be encoded: {0}")]
    Json(#[from] serde_json::Error),
    /// IO operation failed
    #[error("IO operation failed: {0}")]
    Io(#[from] io::Error),
    /// The encoded payload does not fit the caller's byte budget
    #[error("Payload needs {required} bytes, budget is {budget}")]
    ByteBudget {
        /// Bytes the encoding requires
        required: usize,
        /// Bytes the caller allowed
        budget: usize,
    },
    /// Float value bounds do not form a valid half-open range
    #[error("Float bounds invalid: min {min} must be below max {max}")]
    FloatBounds {
        /// Lower bound, inclusive
        min: f64,
        /// Upper bound, exclusive
        max: f64,
    },
}

/// To serialize into bytes
pub trait Serialize {
    /// Write bytes into writer, subject to `max_bytes` limitations.
    ///
    /// # Errors
    ///
    /// Most implementations are serializing data in some way. The errors that
    /// result come from serialization crackups.
    fn to_bytes<W, R>(&mut self, rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write;
}
