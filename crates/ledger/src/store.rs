//! The sharded ledger store.

use crate::blob::{BlobStore, BlobView};
use crate::{shard_seq, PRIMARY_SHARD_SIZE, RAW_SHARD_SIZE};
use hotpocket_types::{
    Hash, LedgerInputRow, LedgerOutputRow, LedgerRecord, PublicKey, SeqHash, UserInput, UserOutput,
};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const CF_LEDGER: &str = "ledger";
const CF_USERS: &str = "users";
const CF_INPUTS: &str = "inputs";
const CF_OUTPUTS: &str = "outputs";
const CF_INDEX: &str = "index";
const CF_META: &str = "meta";
const CF_NAMES: [&str; 6] = [CF_LEDGER, CF_USERS, CF_INPUTS, CF_OUTPUTS, CF_INDEX, CF_META];

const META_VERSION_KEY: &[u8] = b"ledger_version";
const LEDGER_VERSION: &str = "1";

/// Storage failures.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// rocksdb failure.
    #[error("database error: {0}")]
    Database(String),
    /// Blob file IO failure.
    #[error("blob io error: {0}")]
    BlobIo(#[from] std::io::Error),
    /// A row failed to (de)serialize.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The appended record does not continue the chain; the caller must
    /// state-sync before writing again.
    #[error("chain gap: tail is {tail_seq}, record is {record_seq}")]
    ChainGap { tail_seq: u64, record_seq: u64 },
    /// The record's prev hash does not match the tail's hash.
    #[error("chain fork at seq {seq}")]
    ChainFork { seq: u64 },
}

impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        LedgerError::Database(e.to_string())
    }
}

/// Sharded ledger store.
///
/// One rocksdb per primary shard, one blob file per raw shard. The
/// ledger writer is the single producer; readers share the cached
/// handles.
pub struct LedgerStore {
    root: PathBuf,
    shards: Mutex<HashMap<u64, Arc<DB>>>,
    blobs: Mutex<HashMap<u64, Arc<Mutex<BlobStore>>>>,
    /// Cached chain tail.
    last: Mutex<LedgerRecord>,
}

impl LedgerStore {
    /// Open the store under `root`, seeding the genesis record when the
    /// store is brand new.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("primary"))?;
        std::fs::create_dir_all(root.join("raw"))?;

        let store = Self {
            root,
            shards: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            last: Mutex::new(LedgerRecord::genesis()),
        };

        match store.scan_last()? {
            Some(last) => {
                info!(seq_no = last.seq_no, "Ledger store opened");
                *store.last.lock() = last;
            }
            None => {
                info!("Empty ledger store, seeding genesis");
                let genesis = LedgerRecord::genesis();
                store.put_record(&genesis, &[], &[], &[])?;
                *store.last.lock() = genesis;
            }
        }

        Ok(store)
    }

    /// The chain tail.
    pub fn last_record(&self) -> LedgerRecord {
        self.last.lock().clone()
    }

    /// The chain tail as a SeqHash.
    pub fn lcl(&self) -> SeqHash {
        let last = self.last.lock();
        SeqHash::new(last.seq_no, last.ledger_hash)
    }

    /// Tail id of the primary shard chain: the shard index paired with
    /// the newest record hash inside it.
    pub fn primary_shard_tail(&self) -> SeqHash {
        let last = self.last.lock();
        SeqHash::new(shard_seq(last.seq_no, PRIMARY_SHARD_SIZE), last.ledger_hash)
    }

    /// Tail id of the raw shard chain.
    pub fn raw_shard_tail(&self) -> SeqHash {
        let last = self.last.lock();
        SeqHash::new(shard_seq(last.seq_no, RAW_SHARD_SIZE), last.ledger_hash)
    }

    /// Append a committed round transactionally.
    ///
    /// Fails without writing when the record does not continue the
    /// chain (spec: the caller must state-sync).
    pub fn append(
        &self,
        record: &LedgerRecord,
        users: &[PublicKey],
        inputs: &[UserInput],
        outputs: &[UserOutput],
    ) -> Result<(), LedgerError> {
        {
            let tail = self.last.lock();
            if record.seq_no != tail.seq_no + 1 {
                return Err(LedgerError::ChainGap {
                    tail_seq: tail.seq_no,
                    record_seq: record.seq_no,
                });
            }
            if record.prev_ledger_hash != tail.ledger_hash {
                return Err(LedgerError::ChainFork { seq: record.seq_no });
            }
        }

        self.put_record(record, users, inputs, outputs)?;
        *self.last.lock() = record.clone();

        debug!(
            seq_no = record.seq_no,
            inputs = inputs.len(),
            outputs = outputs.len(),
            "Ledger record appended"
        );
        Ok(())
    }

    /// Fetch a record by sequence number.
    pub fn get_by_seq_no(&self, seq_no: u64) -> Result<Option<LedgerRecord>, LedgerError> {
        let db = self.shard_db(shard_seq(seq_no, PRIMARY_SHARD_SIZE))?;
        let cf = cf(&db, CF_LEDGER)?;
        match db.get_cf(cf, seq_no.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch a record by its ledger hash.
    pub fn get_by_hash(&self, ledger_hash: &Hash) -> Result<Option<LedgerRecord>, LedgerError> {
        // The hash index lives in the shard that owns the record; scan
        // newest-first since lookups are almost always near the tail.
        let tail_shard = shard_seq(self.last.lock().seq_no, PRIMARY_SHARD_SIZE);
        for shard in (0..=tail_shard).rev() {
            let db = self.shard_db(shard)?;
            let cf = cf(&db, CF_INDEX)?;
            if let Some(bytes) = db.get_cf(cf, hash_index_key(ledger_hash))? {
                let seq_no = u64::from_be_bytes(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| LedgerError::Corrupt("hash index".into()))?,
                );
                return self.get_by_seq_no(seq_no);
            }
        }
        Ok(None)
    }

    /// Users admitted in a round.
    pub fn get_users_by_seq_no(&self, seq_no: u64) -> Result<Vec<PublicKey>, LedgerError> {
        let db = self.shard_db(shard_seq(seq_no, PRIMARY_SHARD_SIZE))?;
        let cf = cf(&db, CF_USERS)?;
        let mut users = Vec::new();
        for item in db.prefix_iterator_cf(cf, seq_no.to_be_bytes()) {
            let (key, _) = item?;
            if key.len() != 8 + 32 || key[..8] != seq_no.to_be_bytes() {
                break;
            }
            let mut pk = [0u8; 32];
            pk.copy_from_slice(&key[8..]);
            users.push(PublicKey(pk));
        }
        Ok(users)
    }

    /// Input rows of a round.
    pub fn get_inputs_by_seq_no(&self, seq_no: u64) -> Result<Vec<LedgerInputRow>, LedgerError> {
        self.rows_by_seq(seq_no, CF_INPUTS)
    }

    /// Output rows of a round.
    pub fn get_outputs_by_seq_no(&self, seq_no: u64) -> Result<Vec<LedgerOutputRow>, LedgerError> {
        self.rows_by_seq(seq_no, CF_OUTPUTS)
    }

    /// Find an input row by its container digest (replay queries).
    pub fn get_input_by_hash(&self, hash: &Hash) -> Result<Option<LedgerInputRow>, LedgerError> {
        let tail_shard = shard_seq(self.last.lock().seq_no, PRIMARY_SHARD_SIZE);
        for shard in (0..=tail_shard).rev() {
            let db = self.shard_db(shard)?;
            let cf = cf(&db, CF_INDEX)?;
            if let Some(bytes) = db.get_cf(cf, input_index_key(hash))? {
                return Ok(Some(decode(&bytes)?));
            }
        }
        Ok(None)
    }

    /// A run of up to `limit` consecutive records starting at
    /// `min_seq_no`, for serving ledger catch-up.
    pub fn read_run(&self, min_seq_no: u64, limit: u64) -> Result<Vec<LedgerRecord>, LedgerError> {
        let tail = self.last.lock().seq_no;
        let mut records = Vec::new();
        let mut seq = min_seq_no;
        while seq <= tail && (records.len() as u64) < limit {
            match self.get_by_seq_no(seq)? {
                Some(record) => records.push(record),
                None => break,
            }
            seq += 1;
        }
        Ok(records)
    }

    /// Adopt records fetched from a peer during catch-up.
    ///
    /// Each record must chain onto the current tail and hash to its own
    /// `ledger_hash`; adoption stops at the first record that does not.
    /// Side tables stay empty for adopted rounds - the blobs were never
    /// observed locally. Returns how many records were adopted.
    pub fn adopt_records(&self, records: &[LedgerRecord]) -> Result<usize, LedgerError> {
        let mut adopted = 0;
        for record in records {
            if record.compute_hash() != record.ledger_hash {
                debug!(seq_no = record.seq_no, "Catch-up record fails its own hash");
                break;
            }
            match self.append(record, &[], &[], &[]) {
                Ok(()) => adopted += 1,
                Err(LedgerError::ChainGap { .. }) | Err(LedgerError::ChainFork { .. }) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(adopted)
    }

    /// Read an input blob back through its row.
    pub fn read_input_blob(&self, row: &LedgerInputRow) -> Result<Vec<u8>, LedgerError> {
        let blob = self.blob_store(shard_seq(row.ledger_seq_no, RAW_SHARD_SIZE))?;
        let mut blob = blob.lock();
        Ok(blob.read_buf(BlobView {
            offset: row.blob_offset,
            size: row.blob_size,
        })?)
    }

    // ── internals ────────────────────────────────────────────────────────

    fn rows_by_seq<T: serde::de::DeserializeOwned>(
        &self,
        seq_no: u64,
        cf_name: &str,
    ) -> Result<Vec<T>, LedgerError> {
        let db = self.shard_db(shard_seq(seq_no, PRIMARY_SHARD_SIZE))?;
        let cf = cf(&db, cf_name)?;
        let mut rows = Vec::new();
        for item in db.prefix_iterator_cf(cf, seq_no.to_be_bytes()) {
            let (key, value) = item?;
            if key.len() < 8 || key[..8] != seq_no.to_be_bytes() {
                break;
            }
            rows.push(decode(&value)?);
        }
        Ok(rows)
    }

    fn put_record(
        &self,
        record: &LedgerRecord,
        users: &[PublicKey],
        inputs: &[UserInput],
        outputs: &[UserOutput],
    ) -> Result<(), LedgerError> {
        // Blobs first; the row batch only commits after the bytes are
        // in the raw shard.
        let raw_shard = shard_seq(record.seq_no, RAW_SHARD_SIZE);
        let blob = self.blob_store(raw_shard)?;
        let mut input_rows = Vec::with_capacity(inputs.len());
        let mut output_rows = Vec::with_capacity(outputs.len());
        {
            let mut blob = blob.lock();
            for input in inputs {
                let view = blob.write_buf(&input.input_container)?;
                input_rows.push(LedgerInputRow {
                    ledger_seq_no: record.seq_no,
                    pubkey: input.pubkey,
                    hash: input.digest(),
                    nonce: input.nonce,
                    blob_offset: view.offset,
                    blob_size: view.size,
                });
            }
            for output in outputs {
                let mut first_offset = 0;
                for (i, buffer) in output.buffers.iter().enumerate() {
                    let view = blob.write_buf(buffer)?;
                    if i == 0 {
                        first_offset = view.offset;
                    }
                }
                output_rows.push(LedgerOutputRow {
                    ledger_seq_no: record.seq_no,
                    pubkey: output.pubkey,
                    hash: output.digest(),
                    blob_offset: first_offset,
                    blob_count: output.buffers.len() as u64,
                });
            }
        }

        let db = self.shard_db(shard_seq(record.seq_no, PRIMARY_SHARD_SIZE))?;
        let mut batch = WriteBatch::default();

        batch.put_cf(cf(&db, CF_LEDGER)?, record.seq_no.to_be_bytes(), encode(record));
        batch.put_cf(
            cf(&db, CF_INDEX)?,
            hash_index_key(&record.ledger_hash),
            record.seq_no.to_be_bytes(),
        );

        for user in users {
            let mut key = Vec::with_capacity(40);
            key.extend_from_slice(&record.seq_no.to_be_bytes());
            key.extend_from_slice(user.as_bytes());
            batch.put_cf(cf(&db, CF_USERS)?, key, b"");
        }

        for (i, row) in input_rows.iter().enumerate() {
            batch.put_cf(cf(&db, CF_INPUTS)?, row_key(record.seq_no, i), encode(row));
            batch.put_cf(cf(&db, CF_INDEX)?, input_index_key(&row.hash), encode(row));
        }

        for (i, row) in output_rows.iter().enumerate() {
            batch.put_cf(cf(&db, CF_OUTPUTS)?, row_key(record.seq_no, i), encode(row));
        }

        db.write(batch)?;
        Ok(())
    }

    fn shard_db(&self, shard: u64) -> Result<Arc<DB>, LedgerError> {
        let mut shards = self.shards.lock();
        if let Some(db) = shards.get(&shard) {
            return Ok(Arc::clone(db));
        }

        let path = self.root.join("primary").join(shard.to_string());
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = CF_NAMES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();
        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        // Stamp the version row once per shard.
        let meta = db
            .cf_handle(CF_META)
            .ok_or_else(|| LedgerError::Database("meta cf missing".into()))?;
        if db.get_cf(meta, META_VERSION_KEY)?.is_none() {
            db.put_cf(meta, META_VERSION_KEY, LEDGER_VERSION.as_bytes())?;
        }

        let db = Arc::new(db);
        shards.insert(shard, Arc::clone(&db));
        Ok(db)
    }

    fn blob_store(&self, shard: u64) -> Result<Arc<Mutex<BlobStore>>, LedgerError> {
        let mut blobs = self.blobs.lock();
        if let Some(store) = blobs.get(&shard) {
            return Ok(Arc::clone(store));
        }
        let dir = self.root.join("raw").join(shard.to_string());
        std::fs::create_dir_all(&dir)?;
        let store = Arc::new(Mutex::new(BlobStore::open(dir.join("blobs.bin"))?));
        blobs.insert(shard, Arc::clone(&store));
        Ok(store)
    }

    /// Find the newest record on disk (recovery scan).
    fn scan_last(&self) -> Result<Option<LedgerRecord>, LedgerError> {
        let primary = self.root.join("primary");
        let mut newest_shard: Option<u64> = None;
        for entry in std::fs::read_dir(&primary)? {
            let entry = entry?;
            if let Some(shard) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<u64>().ok())
            {
                newest_shard = Some(newest_shard.map_or(shard, |cur| cur.max(shard)));
            }
        }
        let Some(shard) = newest_shard else {
            return Ok(None);
        };

        let db = self.shard_db(shard)?;
        let cf = cf(&db, CF_LEDGER)?;
        let mut iter = db.iterator_cf(cf, rocksdb::IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(decode(&value)?))
            }
            None => Ok(None),
        }
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily, LedgerError> {
    db.cf_handle(name)
        .ok_or_else(|| LedgerError::Database(format!("column family {name} not found")))
}

fn row_key(seq_no: u64, index: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(12);
    key.extend_from_slice(&seq_no.to_be_bytes());
    key.extend_from_slice(&(index as u32).to_be_bytes());
    key
}

fn hash_index_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.extend_from_slice(b"l:");
    key.extend_from_slice(hash.as_bytes());
    key
}

fn input_index_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(34);
    key.extend_from_slice(b"i:");
    key.extend_from_slice(hash.as_bytes());
    key
}

fn encode<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode::serialize(value).expect("row serialize")
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, LedgerError> {
    bincode::deserialize(bytes).map_err(|e| LedgerError::Corrupt(e.to_string()))
}
