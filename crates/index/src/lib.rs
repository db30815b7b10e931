mod checkpoint;
mod chunker;
mod descriptor;
mod error;
mod indexer;
mod languages;
mod progress;
mod scanner;
mod status;

pub use checkpoint::{Checkpoint, CheckpointPhase, CheckpointStore};
pub use chunker::Chunker;
pub use descriptor::{DESCRIPTOR_VERSION, DescriptorStore, IndexDescriptor, metadata_checksum};
pub use error::IndexError;
pub use indexer::{IndexOptions, IndexStats, Indexer};
pub use progress::{EtaTracker, IndexPhase, IndexProgress, ProgressReporter, ProgressSender};
pub use scanner::{ScanDiff, ScannedFile, Scanner};
pub use status::{IndexStatus, StalenessReport, check_staleness, get_status};
