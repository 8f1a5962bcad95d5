use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http status {0} for {1}")]
    HttpStatus(StatusCode, String),
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("malformed webdav response: {0}")]
    Xml(String),
    #[error("missing storage option: {0}")]
    MissingOption(&'static str),
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),
    #[error("unsupported storage type: {0}")]
    UnknownBackend(String),
    #[error("file not found: {0}")]
    NotFound(String),
}

impl From<quick_xml::Error> for StorageError {
    fn from(e: quick_xml::Error) -> Self {
        StorageError::Xml(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;
