//! Component databases stored by [`crate::DataBase`].

use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::{MappedFile, RemapLock};

mod address_asset;
mod asset;
mod block;
mod cert;
mod did;
mod history;
mod spend;
mod stealth;
mod transaction;

pub use address_asset::{AddressAssetDatabase, BusinessRow};
pub use asset::{AssetDatabase, AssetRecord};
pub use block::{BlockDatabase, BlockResult};
pub use cert::{CertDatabase, CertRecord};
pub use did::{DidDatabase, DidRecord};
pub use history::{HistoryDatabase, HistoryRow, PointKind};
pub use spend::SpendDatabase;
pub use stealth::{PrefixFilter, StealthDatabase, StealthRow};
pub use transaction::{TransactionDatabase, TransactionResult};

/// Lifecycle shared by every component database.
///
/// `create` and `start` map the component's files themselves; `stop` and
/// `close` act on the files only.
pub trait Component {
    /// Backing files of the component
    fn files(&self) -> Vec<&Arc<MappedFile>>;

    /// Map freshly touched files and write empty tables.
    fn create(&self) -> Result<()>;

    /// Map existing files and load persisted counters.
    fn start(&self) -> Result<()>;

    /// Persist allocator counters.
    fn sync(&self) -> Result<()>;

    fn stop(&self) -> Result<()> {
        for file in self.files() {
            file.stop()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        for file in self.files() {
            file.close()?;
        }
        Ok(())
    }
}

pub(crate) fn open(path: &Path, remap_lock: &RemapLock) -> Arc<MappedFile> {
    Arc::new(MappedFile::new(path, remap_lock.clone()))
}

pub(crate) fn start_files(component: &dyn Component) -> Result<()> {
    for file in component.files() {
        file.start()?;
    }
    Ok(())
}
