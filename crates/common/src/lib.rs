/**
 * Hit and byte accumulators shared between the
 *  HTTP handlers and the keepalive reporter.
 */
pub mod counters;
/**
 * Coordinator manifest codec.
 * Decodes the zstd-compressed Avro file list
 *  (or its JSON form) into a `FileList`.
 */
pub mod manifest;
/**
 * Wire and domain types exchanged with the
 *  coordinator.
 */
pub mod model;
/**
 * HMAC signing, URL signature checks and
 *  content digest validation.
 */
pub mod signing;
/**
 * Helper for setting build version information
 *  at compile time.
 */
pub mod version;

pub mod prelude {
    pub use crate::counters::{CounterSnapshot, Counters};
    pub use crate::manifest::{decode_file_list, ManifestError};
    pub use crate::model::{
        AgentConfiguration, CertificateResponse, EnableRequest, FileInfo, FileList, Flavor,
        GcCounter, KeepAliveRequest, SyncConfig,
    };
    pub use crate::signing::{check_sign, create_hmac_sha256, hash_to_filename, validate_file};
    pub use crate::version::build_info;
}
