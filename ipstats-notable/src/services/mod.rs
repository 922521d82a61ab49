//! External service clients

pub mod inat_client;

pub use inat_client::{INatClient, INatClientConfig, INatError};
