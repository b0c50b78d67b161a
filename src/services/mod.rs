pub mod memory_transport;
pub mod transport;
pub mod upload_queue;
pub mod webdav_transport;

pub use memory_transport::{MemoryTransport, StoredObject};
pub use transport::{ProgressFn, TransferControl, TransferPayload, TransferSignal, UploadTransport};
pub use upload_queue::{compress_async, UploadQueue};
pub use webdav_transport::WebDavTransport;
