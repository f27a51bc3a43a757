//! Envreport engine: storage, extraction, indexing and the polling pipeline.
mod credentials;
mod decode;
mod extract;
mod http;
mod index;
mod persist;
mod pipeline;
mod poller;
mod router;
mod store;

pub use credentials::{
    AccessToken, AccountSas, ClientCredentials, CredentialError, CredentialSettings, SasProvider,
    SasSession, SasToken, StaticSas, StorageKeyProvider, DEFAULT_AUTHORITY_HOST,
    DEFAULT_MANAGEMENT_ENDPOINT, MANAGEMENT_SCOPE, SAS_VERSION,
};
pub use decode::{decode_report, DecodeError, DecodedReport};
pub use extract::{
    DataContainerExtractor, Extraction, ExtractionError, ExtractionSource, Extractor,
    PAYLOAD_ATTRIBUTE,
};
pub use http::{HttpError, HttpFailure, HttpSettings};
pub use index::{
    upload_batch, AzureSearchPublisher, IndexPublisher, PublishError, PublishPolicy,
    SearchSettings, SEARCH_API_VERSION,
};
pub use persist::{ensure_dir, AtomicFileWriter, PersistError};
pub use pipeline::{Pipeline, PipelineSettings, RunError, RunSummary, Stage, REPORT_EXTENSION};
pub use poller::{PollSettings, Poller};
pub use router::{FileRouter, RouteReport, RouteStage, RoutingError};
pub use store::{
    join_path, AzureFileShare, DirEntry, DirStatus, FileStore, LocalDirectoryStore, StoreError,
    AZURE_FILES_VERSION, MAX_RANGE_BYTES,
};
