mod client;
mod connection;
pub mod constant;
pub mod error;
pub mod event_loop;
pub mod handler;
pub mod operation;
mod opts;
mod query;
pub mod row;

pub use client::Client;
pub use connection::{Connection, ConnectionContext};
pub use error::{Error, Result};
pub use operation::{
    CertValidator, CollectConsumer, ConnectOperation, FetchConsumer, FetchOperation,
    OperationKind, OperationResult, OperationState, QueryResult, QueryStream, RowStream,
    StreamItem,
};
pub use opts::{
    AttributeMap, CertValidation, CertValidationContext, CertValidatorCallback, ConnectionKey,
    ConnectionOptions, SslOptionsProvider,
};
pub use query::{MultiQuery, Query};
