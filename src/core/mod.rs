pub mod adopt;
pub mod checkpoint;
pub mod comparator;
pub mod duplicate;
pub mod hash_cache;
pub mod hasher;
pub mod layout;
pub mod lock;
pub mod manifest;
pub mod metadata;
pub mod progress;
pub mod rebuild;
pub mod rewrite;
pub mod scanner;
pub mod synchronizer;
pub mod trash;

pub use adopt::{AdoptionPipeline, AdoptionSummary};
pub use checkpoint::{
    CheckpointManager, OperationCheckpoint, OperationKind, OperationStatus, ResumePoint,
};
pub use comparator::{DiffSummary, LibraryComparator, LibraryDiff};
pub use duplicate::{DuplicateCheck, DuplicateEvent, DuplicateResolver, DuplicateStage};
pub use hash_cache::{CacheStats, HashCache};
pub use hasher::{Blake3Hasher, ContentHasher};
pub use layout::{LibraryLayout, QuarantineCategory};
pub use lock::{OperationLock, OperationToken};
pub use manifest::{ManifestRecord, ManifestReplay, ManifestWriter};
pub use metadata::{ExifTool, MetadataError, MetadataReader, MetadataWriter};
pub use progress::{FileOutcome, ProgressEvent, ProgressPhase, ProgressSink};
pub use rebuild::{AtomicRebuilder, RebuildReport};
pub use rewrite::{MetadataChange, MetadataRewriteCoordinator, RewriteOutcome, RewriteSubject};
pub use scanner::{FileScanner, ScanConfig, ScannedFile};
pub use synchronizer::{
    LibrarySynchronizer, SyncOptions, SyncPreview, SyncReport, SyncStatus,
};
pub use trash::{DeleteReport, RestoreReport, TrashBin};
