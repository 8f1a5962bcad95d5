//! Types shared between the agent, the storage backends and the coordinator.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// One distributable object from the coordinator manifest.
///
/// Identity is the content hash: two entries with the same hash
/// describe the same bytes and share a single storage slot, whatever
/// their `path`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path on the coordinator, used to fetch the content (`/a/b.jar`).
    pub path: String,
    /// Lower-case hex digest, MD5 (32 chars) or SHA-1 (40 chars).
    pub hash: String,
    pub size: u64,
    /// Modification time in milliseconds since the unix epoch.
    pub mtime: i64,
}

impl FileInfo {
    /// Content-addressed location of this file inside a storage backend.
    pub fn storage_path(&self) -> String {
        crate::signing::hash_to_filename(&self.hash)
    }
}

impl PartialEq for FileInfo {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for FileInfo {}

impl Hash for FileInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// A full manifest snapshot. Each new list replaces the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileList {
    pub files: Vec<FileInfo>,
}

impl FileList {
    pub fn new(files: Vec<FileInfo>) -> Self {
        Self { files }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Latest modification time in the list, used as the `lastModified`
    /// filter of the next manifest recheck.
    pub fn last_modified(&self) -> Option<i64> {
        self.files.iter().map(|f| f.mtime).max()
    }

    /// The live set for garbage collection.
    pub fn hashes(&self) -> HashSet<&str> {
        self.files.iter().map(|f| f.hash.as_str()).collect()
    }
}

/// Download settings handed out by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Descriptor of where content is pulled from (`center` for the coordinator).
    pub source: String,
    /// Maximum number of simultaneous downloads.
    pub concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            source: "center".to_string(),
            concurrency: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfiguration {
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeTokenRequest {
    pub cluster_id: String,
    pub challenge: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshTokenRequest {
    pub cluster_id: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    pub token: String,
    /// Lifetime in milliseconds.
    pub ttl: u64,
}

/// Payload of the `keep-alive` control event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    /// ISO-8601 timestamp of the report.
    pub time: String,
    pub hits: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    pub runtime: String,
    pub storage: String,
}

/// Payload of the `enable` control event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub port: u16,
    pub version: String,
    pub byoc: bool,
    pub no_fast_enable: bool,
    pub flavor: Flavor,
}

/// Certificate material returned by `request-cert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateResponse {
    pub cert: String,
    pub key: String,
}

/// Outcome of one garbage collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcCounter {
    pub count: u64,
    pub size: u64,
}

impl GcCounter {
    pub fn record(&mut self, size: u64) {
        self.count += 1;
        self.size += size;
    }
}
