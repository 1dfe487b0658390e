//! Protocol crate for the VidForge transcoding server.
//!
//! Contains the wire models shared by the server and the sender, the typed
//! error taxonomy, and a `reqwest`-based client covering the REST surface.

pub mod client;
pub mod error;
pub mod models;

pub use client::{Client, ClientConfig};
pub use error::{ApiError, ApiResult};
