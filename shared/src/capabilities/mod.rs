//! Collaborators at the edge of the crate: the durable key-value store and
//! the network transport.

pub mod http;
pub mod kv;

pub use self::http::{
    classify, BatchResponse, RequestOptions, ResponseClass, Transport, TransportError,
    TransportKind, ValidatedUrl,
};
pub use self::kv::{
    validate_key, KvError, MemoryStorage, StorageBackend, StorageErrorCode, StorageProbe,
};

#[cfg(feature = "http")]
pub use self::http::HttpTransport;
