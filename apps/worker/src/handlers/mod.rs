pub mod blob_event;

pub use blob_event::{BlobEvent, BlobEventData, BlobEventHandler, BlobLocation, BLOB_CREATED};
