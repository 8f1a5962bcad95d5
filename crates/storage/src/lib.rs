/**
 * Alist redirect-resolving decorator around
 *  the WebDAV backend.
 */
pub mod alist;
/**
 * The `Storage` contract and the serve
 *  decision type handed to the HTTP layer.
 */
pub mod backend;
pub mod error;
/**
 * Backend selection from a name and an
 *  option map.
 */
pub mod factory;
/**
 * Local filesystem backend.
 */
pub mod file;
pub mod index;
/**
 * MinIO and OSS through the S3 protocol.
 */
pub mod object;
pub mod options;
/**
 * WebDAV client helper and backend.
 */
pub mod webdav;

pub mod prelude {
    pub use crate::backend::{ServeAction, ServeResult, Storage};
    pub use crate::error::StorageError;
    pub use crate::factory::{create_storage, StorageKind};
    pub use crate::file::FileStorage;
    pub use crate::options::StorageOptions;
}
