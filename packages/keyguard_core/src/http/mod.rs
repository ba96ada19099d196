//! HTTP integration
//!
//! - `filter`: a warp filter that verifies signed requests before the handler runs
//! - `client`: attaches signed-request headers to an outbound `reqwest::Request`

pub mod client;
pub mod filter;

pub use client::sign_reqwest_request;
pub use filter::{handle_rejection, signed_request, SignatureRejection};
