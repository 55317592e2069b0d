//! Azure Table storage client for hub checkpoint state.
//!
//! One entity per (consumer group, partition): the table name is derived
//! from the hub identity, the partition key from the consumer group, and
//! the row key from the partition id, so independent hubs and groups never
//! collide inside a storage account. The state itself is an opaque blob
//! owned by the caller.

pub mod state;

pub use crate::state::{StateEntity, StateTableClient};

pub type Result<T> = core::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Azure Table auth - {0}")]
    Auth(String),

    #[error("Azure Table request - {0}")]
    Request(String),

    #[error("Azure Table responded {status} - {message}")]
    Response { status: u16, message: String },

    #[error("Encoding entity - {0}")]
    Encoding(String),
}

#[derive(Clone, PartialEq)]
pub struct AzureTableConfig {
    /// Storage account name, e.g. `contosostate`.
    pub account: String,
    /// Base64-encoded shared account key.
    pub access_key: String,
}

impl std::fmt::Debug for AzureTableConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTableConfig")
            .field("account", &self.account)
            .field("access_key", &"****")
            .finish()
    }
}
