//! Automates alpha research against the Brain platform: authenticate, submit expressions for
//! simulation in batches, poll for the results and append them to a delimited file.
//!
//! The remote service sits behind [http::brain::Client]. [client::brain::HttpClient] talks to the
//! real service, [client::brain::LocalClient] runs against an in-process model of it. Everything
//! that retries lives in [session::Session], the worker pool lives in [pipeline].
pub mod client;
pub mod http;
pub mod input;
pub mod pipeline;
pub mod session;
pub mod settings;
pub mod sink;
