//! Update protocol, read view and contributor registry.

mod registry;
mod transaction;
mod view;

pub use registry::{Contributor, FnContributor, IndexConfiguration, IndexConfigurationBuilder};
pub use transaction::{
    reindex_file, remove_file, CommitSummary, FileTransaction, LayerUpdater,
};
pub use view::{
    DiskIndexQuery, FileHeadersQuery, FileInfoQuery, FilesWithErrorsQuery,
    ForwardReferencesQuery, Index, Query, ReferencesQuery,
};
