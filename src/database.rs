//! Top-level [`Database`] handle: wires the segment heap, control-block
//! table, compactor, read cache, and top-root table into one opened
//! instance — a struct of owned subsystem handles behind a small
//! constructor plus accessor methods.

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::cache::{DecayHandle, DecaySweeper, PinBudget};
use crate::cbt::{Address, ControlBlockTable};
use crate::compactor::{Compactor, CompactorHandle, SegmentMetaTable};
use crate::config::Config;
use crate::epoch::EpochTracker;
use crate::error::{Error, Result};
use crate::node::{LeafNode, NodeBody};
use crate::registry::RegistrySlot;
use crate::segment::heap::SegmentHeap;
use crate::segment::log::SegmentWriter;
use crate::trie::NodeStore;
use crate::txn::{ReadTxn, RootTable, WriteTxn};

const HEADER_MAGIC: u32 = 0xA4B0_6B76; // "arbokv" folded into 4 bytes
const HEADER_FILE: &str = "header";
const SEGMENTS_FILE: &str = "segs";

/// On-disk header: magic/version tag, clean-shutdown flag, and the root
/// table as of the last clean close. Persisted as JSON rather than a
/// raw mmap'd page — directory-layout plumbing beyond stating
/// persistence semantics is explicitly out of scope.
#[derive(Debug, Serialize, Deserialize)]
struct Header {
    magic: u32,
    clean_shutdown: bool,
    roots: Vec<u32>,
    config: Config,
}

/// An opened store: one segment heap, one control-block table, a
/// top-root table, and the background compactor/decay threads that keep
/// them tidy.
pub struct Database {
    _registry: RegistrySlot,
    store: NodeStore,
    heap: Arc<SegmentHeap>,
    epoch: Arc<EpochTracker>,
    meta: Arc<SegmentMetaTable>,
    pin_budget: Arc<PinBudget>,
    roots: RootTable,
    config: Config,
    path: Option<PathBuf>,
    header_lock: Option<File>,
    compactor: Option<CompactorHandle>,
    decay: Option<DecayHandle>,
}

impl Database {
    /// Open (creating if absent) a database directory at `path`.
    #[instrument(skip(config))]
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let header_path = path.join(HEADER_FILE);
        let mut header_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&header_path)?;
        header_file
            .try_lock_exclusive()
            .map_err(|_| Error::Config(format!("database at {} is already open", path.display())))?;

        let mut contents = String::new();
        header_file.read_to_string(&mut contents)?;
        let previous: Option<Header> = if contents.is_empty() {
            None
        } else {
            serde_json::from_str(&contents).ok()
        };

        let heap = Arc::new(SegmentHeap::open(&path.join(SEGMENTS_FILE), config.initial_segments)?);
        let (store, epoch, meta, roots) = match &previous {
            Some(header) if header.magic == HEADER_MAGIC && header.clean_shutdown => {
                let cbt = Arc::new(ControlBlockTable::new());
                let epoch = Arc::new(EpochTracker::new());
                let meta = Arc::new(SegmentMetaTable::default());
                let store = NodeStore::new(heap.clone(), cbt);
                let roots = RootTable::new(Address::from_raw(header.roots[0]), header.roots.len());
                for (slot, raw) in header.roots.iter().enumerate() {
                    roots.publish(slot as u32, Address::from_raw(*raw));
                }
                (store, epoch, meta, roots)
            }
            _ => Self::bootstrap(heap.clone(), &config)?,
        };

        let this = Self::assemble(store, heap, epoch, meta, roots, config, Some(path.to_path_buf()), Some(header_file))?;
        Ok(this)
    }

    /// Create an in-memory, non-persistent database for tests and
    /// embedded one-off use.
    pub fn create_anon(config: Config) -> Result<Self> {
        let heap = Arc::new(SegmentHeap::anon(config.initial_segments)?);
        let (store, epoch, meta, roots) = Self::bootstrap(heap.clone(), &config)?;
        Self::assemble(store, heap, epoch, meta, roots, config, None, None)
    }

    fn bootstrap(
        heap: Arc<SegmentHeap>,
        config: &Config,
    ) -> Result<(NodeStore, Arc<EpochTracker>, Arc<SegmentMetaTable>, RootTable)> {
        let cbt = Arc::new(ControlBlockTable::new());
        let epoch = Arc::new(EpochTracker::new());
        let meta = Arc::new(SegmentMetaTable::default());
        let store = NodeStore::new(heap.clone(), cbt);
        let mut boot_writer = SegmentWriter::new(heap, epoch.clone(), meta.clone(), config.sync_mode)?;
        let empty_root = store.allocate(&mut boot_writer, &NodeBody::Leaf(LeafNode::default()))?;
        boot_writer.seal()?;
        let roots = RootTable::new(empty_root, Config::TOP_ROOT_COUNT);
        Ok((store, epoch, meta, roots))
    }

    fn assemble(
        store: NodeStore,
        heap: Arc<SegmentHeap>,
        epoch: Arc<EpochTracker>,
        meta: Arc<SegmentMetaTable>,
        roots: RootTable,
        config: Config,
        path: Option<PathBuf>,
        header_lock: Option<File>,
    ) -> Result<Self> {
        let registry = RegistrySlot::acquire()?;
        let pin_budget = Arc::new(PinBudget::new(config.max_pinned_cache_mb * (1 << 20)));

        let compactor = Compactor::new(&config, heap.clone(), store.cbt().clone(), meta.clone(), epoch.clone())?;
        let compactor = Some(compactor.spawn(Duration::from_secs(1)));

        let decay = if config.enable_read_cache {
            let sweeper = DecaySweeper::new(store.cbt().clone(), Duration::from_secs(config.read_cache_window_sec.max(1)));
            Some(sweeper.spawn())
        } else {
            None
        };

        Ok(Self {
            _registry: registry,
            store,
            heap,
            epoch,
            meta,
            pin_budget,
            roots,
            config,
            path,
            header_lock,
            compactor,
            decay,
        })
    }

    /// This database's configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of top-root slots available for [`Database::read_txn`] /
    /// [`Database::write_txn`].
    pub fn root_slot_count(&self) -> usize {
        self.roots.count()
    }

    /// Bytes currently pinned (`mlock`'d) in the read cache.
    pub fn pin_budget(&self) -> &Arc<PinBudget> {
        &self.pin_budget
    }

    /// Open a read transaction snapshotting `slot`'s current root.
    pub fn read_txn(&self, slot: u32) -> Result<ReadTxn> {
        ReadTxn::start(self.store.clone(), self.epoch.clone(), &self.roots, slot)
    }

    /// Open a read transaction directly on a subtree root Address, as
    /// returned by [`ReadTxn::get_subtree`] or [`WriteTxn::get_subtree`],
    /// rather than a top-root slot.
    pub fn read_subtree(&self, root: Address) -> ReadTxn {
        ReadTxn::at_root(self.store.clone(), self.epoch.clone(), root)
    }

    /// Begin a write transaction against `slot`, blocking until any other
    /// writer on that slot has committed or aborted.
    pub fn write_txn(&self, slot: u32) -> Result<WriteTxn<'_>> {
        WriteTxn::begin(
            self.store.clone(),
            self.heap.clone(),
            self.epoch.clone(),
            self.meta.clone(),
            &self.config,
            &self.roots,
            slot,
        )
    }

    /// Run one compaction sweep synchronously, bypassing the background
    /// compactor thread. Intended for tests and explicit maintenance
    /// windows.
    pub fn compact_once(&self) -> Result<()> {
        let mut compactor = Compactor::new(
            &self.config,
            self.heap.clone(),
            self.store.cbt().clone(),
            self.meta.clone(),
            self.epoch.clone(),
        )?;
        compactor.run_once()?;
        Ok(())
    }

    /// Flush the header file and mark the database as cleanly shut down.
    /// Called automatically on [`Drop`]; exposed directly so callers can
    /// observe and handle a flush failure.
    #[instrument(skip(self))]
    pub fn close(&mut self) -> Result<()> {
        if let Some(compactor) = self.compactor.take() {
            compactor.stop();
        }
        if let Some(decay) = self.decay.take() {
            decay.stop();
        }
        if self.path.is_some() {
            let mut header_file = self.header_lock.take().expect("header file open whenever path is set");
            let roots: Vec<u32> = (0..self.roots.count() as u32)
                .map(|slot| self.roots.current(slot).map(|a| a.raw()))
                .collect::<Result<_>>()?;
            let header = Header {
                magic: HEADER_MAGIC,
                clean_shutdown: true,
                roots,
                config: self.config.clone(),
            };
            let json = serde_json::to_string(&header).map_err(|e| Error::Config(e.to_string()))?;
            header_file.set_len(0)?;
            header_file.seek(SeekFrom::Start(0))?;
            header_file.write_all(json.as_bytes())?;
            header_file.sync_all()?;
            header_file.unlock()?;
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anon_database_opens_and_round_trips_a_key() {
        let db = Database::create_anon(Config::default()).unwrap();
        let mut txn = db.write_txn(0).unwrap();
        txn.insert(b"a", b"1").unwrap();
        txn.commit().unwrap();

        let read = db.read_txn(0).unwrap();
        assert_eq!(read.get(b"a").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn file_backed_database_recovers_roots_after_clean_close() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = Database::open(dir.path(), Config::default()).unwrap();
            let mut txn = db.write_txn(0).unwrap();
            txn.insert(b"k", b"v").unwrap();
            txn.commit().unwrap();
        } // clean drop writes the header

        let db = Database::open(dir.path(), Config::default()).unwrap();
        let read = db.read_txn(0).unwrap();
        assert_eq!(read.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn a_second_open_of_the_same_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let _db = Database::open(dir.path(), Config::default()).unwrap();
        assert!(Database::open(dir.path(), Config::default()).is_err());
    }
}
