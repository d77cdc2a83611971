//! Write-Ahead Log (WAL) for in-flight consensus state.
//!
//! This module provides durable persistence so that a restarted node:
//! 1. Never signs a vote conflicting with one it signed before the crash
//! 2. Can replay the proposals and votes that were in flight above the last
//!    committed height before it rejoins the protocol
//!
//! ## WAL Format
//!
//! The WAL is an append-only file of framed entries with CRC32 checksums:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         WAL Entry                                │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Magic (4 bytes)   │ Version (1 byte)  │ Entry Type (1 byte)      │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Index (8 bytes)   │ Height (8 bytes)  │ Level (8 bytes)          │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload Length (4 bytes)                                         │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ Payload (bincode, variable length)                               │
//! ├──────────────────────────────────────────────────────────────────┤
//! │ CRC32 Checksum (4 bytes)                                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian.
//!
//! ## Entry Types
//!
//! - `Proposal`: a proposal this node signed or voted on
//! - `Vote`: a vote this node signed
//! - `Committed`: a block commit (allows pruning)

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::types::{ProposalData, Vote};
use hotchain_types::Hash;

/// Magic bytes to identify WAL files
const WAL_MAGIC: [u8; 4] = [0x48, 0x43, 0x57, 0x4C]; // "HCWL" - HotChain WAL

/// Current WAL format version
const WAL_VERSION: u8 = 1;

/// Header size in bytes (magic + version + type + index + height + level + length)
const HEADER_SIZE: usize = 34;

/// CRC32 checksum size
const CRC_SIZE: usize = 4;

const WAL_FILE: &str = "consensus.wal";
const WAL_TMP_FILE: &str = "consensus.wal.tmp";

/// Errors that can occur during WAL operations
#[derive(Debug, Error)]
pub enum WalError {
    /// I/O error during WAL operations
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Corrupted WAL entry (checksum mismatch or invalid format)
    #[error("corrupted WAL entry at offset {offset}: {message}")]
    Corrupted {
        /// Byte offset in the WAL file
        offset: u64,
        /// Description of the corruption
        message: String,
    },

    /// Invalid WAL magic bytes
    #[error("invalid WAL magic bytes")]
    InvalidMagic,

    /// Unsupported WAL version
    #[error("unsupported WAL version: {0} (expected {WAL_VERSION})")]
    UnsupportedVersion(u8),

    /// Attempt to record a second, different message for the same slot
    #[error("equivocation detected at height {height}, level {level}: already recorded {}", hex::encode(.existing))]
    EquivocationDetected {
        /// Block height
        height: u64,
        /// Consensus level
        level: u64,
        /// Block hash already recorded for this slot
        existing: Hash,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// WAL was closed
    #[error("WAL is closed")]
    Closed,
}

impl From<bincode::Error> for WalError {
    fn from(e: bincode::Error) -> Self {
        WalError::Serialization(e.to_string())
    }
}

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Configuration for the consensus WAL
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Path to the WAL directory
    pub dir: PathBuf,
    /// Whether to fsync after each write
    pub sync_on_write: bool,
    /// Whether to fail on corrupted entries (false = truncate and continue)
    pub strict_recovery: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/wal"),
            sync_on_write: true,
            strict_recovery: false,
        }
    }
}

/// Entry types in the WAL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalEntryType {
    /// Proposal signed or voted on
    Proposal = 1,
    /// Own vote signed
    Vote = 2,
    /// Block was committed
    Committed = 3,
}

impl TryFrom<u8> for WalEntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(WalEntryType::Proposal),
            2 => Ok(WalEntryType::Vote),
            3 => Ok(WalEntryType::Committed),
            other => Err(other),
        }
    }
}

/// A framed WAL entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    /// Type of the entry
    pub entry_type: WalEntryType,
    /// Monotonic write index
    pub index: u64,
    /// Height the entry belongs to
    pub height: u64,
    /// Level the entry belongs to (0 for commits)
    pub level: u64,
    /// bincode payload
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Serialize the entry to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload_len = self.payload.len() as u32;
        let mut data = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CRC_SIZE);

        data.extend_from_slice(&WAL_MAGIC);
        data.push(WAL_VERSION);
        data.push(self.entry_type as u8);
        data.extend_from_slice(&self.index.to_le_bytes());
        data.extend_from_slice(&self.height.to_le_bytes());
        data.extend_from_slice(&self.level.to_le_bytes());
        data.extend_from_slice(&payload_len.to_le_bytes());
        data.extend_from_slice(&self.payload);

        let crc = crc32_checksum(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }

    /// Deserialize an entry from bytes
    pub fn from_bytes(data: &[u8], offset: u64) -> WalResult<Self> {
        if data.len() < HEADER_SIZE + CRC_SIZE {
            return Err(WalError::Corrupted {
                offset,
                message: "entry too short".to_string(),
            });
        }
        if data[0..4] != WAL_MAGIC {
            return Err(WalError::InvalidMagic);
        }
        if data[4] != WAL_VERSION {
            return Err(WalError::UnsupportedVersion(data[4]));
        }
        let entry_type = WalEntryType::try_from(data[5]).map_err(|t| WalError::Corrupted {
            offset,
            message: format!("invalid entry type: {t}"),
        })?;

        let payload_len = read_u32(&data[30..34]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if data.len() < total_len {
            return Err(WalError::Corrupted {
                offset,
                message: format!(
                    "incomplete entry: expected {} bytes, got {}",
                    total_len,
                    data.len()
                ),
            });
        }

        let body_end = HEADER_SIZE + payload_len;
        let stored_crc = read_u32(&data[body_end..body_end + CRC_SIZE]);
        let computed_crc = crc32_checksum(&data[..body_end]);
        if stored_crc != computed_crc {
            return Err(WalError::Corrupted {
                offset,
                message: format!(
                    "CRC mismatch: stored {:#x}, computed {:#x}",
                    stored_crc, computed_crc
                ),
            });
        }

        Ok(Self {
            entry_type,
            index: read_u64(&data[6..14]),
            height: read_u64(&data[14..22]),
            level: read_u64(&data[22..30]),
            payload: data[HEADER_SIZE..body_end].to_vec(),
        })
    }

    /// Total serialized size of this entry
    pub fn serialized_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CRC_SIZE
    }
}

/// An in-flight message returned by [`ConsensusWal::replay_wal`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// A proposal
    Proposal(ProposalData),
    /// An own vote
    Vote(Vote),
}

#[derive(Debug, Default)]
struct WalState {
    next_index: u64,
    committed_height: u64,
    own_votes: HashMap<(u64, u64, bool), Hash>,
    proposals: HashMap<(u64, u64), Hash>,
    entries_recovered: usize,
}

impl WalState {
    fn apply(&mut self, entry: &WalEntry) -> WalResult<()> {
        self.next_index = self.next_index.max(entry.index + 1);
        match entry.entry_type {
            WalEntryType::Proposal => {
                let proposal: ProposalData = bincode::deserialize(&entry.payload)?;
                self.proposals
                    .insert((entry.height, entry.level), proposal.block.hash());
            }
            WalEntryType::Vote => {
                let vote: Vote = bincode::deserialize(&entry.payload)?;
                self.own_votes
                    .insert((vote.height, vote.level, vote.new_view), vote.block_id);
            }
            WalEntryType::Committed => {
                self.committed_height = self.committed_height.max(entry.height);
            }
        }
        Ok(())
    }

    fn retain_from(&mut self, min_height: u64) {
        self.own_votes.retain(|(h, _, _), _| *h >= min_height);
        self.proposals.retain(|(h, _), _| *h >= min_height);
    }
}

/// Entries read back from a WAL file
struct ScanResult {
    entries: Vec<WalEntry>,
    valid_len: u64,
    corrupted: bool,
}

/// Read every intact entry from `path`, stopping at the first bad one.
fn scan_file(path: &Path, strict: bool) -> WalResult<ScanResult> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    let mut entries = Vec::new();
    let mut corrupted = false;

    while offset < file_len {
        let mut header = [0u8; HEADER_SIZE];
        match reader.read_exact(&mut header) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!("WAL header truncated at offset {}", offset);
                corrupted = true;
                break;
            }
            Err(e) => return Err(WalError::Io(e)),
        }

        if header[0..4] != WAL_MAGIC {
            if strict {
                return Err(WalError::InvalidMagic);
            }
            warn!("Invalid magic at offset {}, truncating WAL", offset);
            corrupted = true;
            break;
        }

        let payload_len = read_u32(&header[30..34]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if offset + total_len as u64 > file_len {
            warn!("WAL entry truncated at offset {}", offset);
            corrupted = true;
            break;
        }

        let mut entry_data = vec![0u8; total_len];
        entry_data[..HEADER_SIZE].copy_from_slice(&header);
        reader.read_exact(&mut entry_data[HEADER_SIZE..])?;

        match WalEntry::from_bytes(&entry_data, offset) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                if strict {
                    return Err(e);
                }
                warn!("Corrupted entry at offset {}: {}", offset, e);
                corrupted = true;
                break;
            }
        }
        offset += total_len as u64;
    }

    Ok(ScanResult {
        entries,
        valid_len: offset,
        corrupted,
    })
}

/// The consensus Write-Ahead Log
pub struct ConsensusWal {
    config: WalConfig,
    file: Mutex<Option<BufWriter<File>>>,
    state: Mutex<WalState>,
}

impl ConsensusWal {
    /// Open or create a consensus WAL, recovering existing entries.
    ///
    /// A corrupt tail is truncated unless `strict_recovery` is set.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let wal_path = config.dir.join(WAL_FILE);
        info!("Opening consensus WAL at: {:?}", wal_path);

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&wal_path)?;
        let file_len = file.metadata()?.len();

        let mut state = WalState::default();
        if file_len > 0 {
            let scan = scan_file(&wal_path, config.strict_recovery)?;
            for entry in &scan.entries {
                state.apply(entry)?;
            }
            state.entries_recovered = scan.entries.len();
            if scan.corrupted {
                warn!(
                    "Truncating WAL to last valid offset {} ({} bytes dropped)",
                    scan.valid_len,
                    file_len - scan.valid_len
                );
                file.set_len(scan.valid_len)?;
            }
            info!(
                entries = state.entries_recovered,
                committed_height = state.committed_height,
                "WAL recovery complete"
            );
        }

        Ok(Self {
            config,
            file: Mutex::new(Some(BufWriter::new(file))),
            state: Mutex::new(state),
        })
    }

    fn path(&self) -> PathBuf {
        self.config.dir.join(WAL_FILE)
    }

    /// Append an entry, assigning the next index.
    fn write_entry(
        &self,
        state: &mut WalState,
        entry_type: WalEntryType,
        height: u64,
        level: u64,
        payload: Vec<u8>,
    ) -> WalResult<()> {
        let entry = WalEntry {
            entry_type,
            index: state.next_index,
            height,
            level,
            payload,
        };
        let data = entry.to_bytes();

        let mut file_guard = self.file.lock();
        let file = file_guard.as_mut().ok_or(WalError::Closed)?;
        file.write_all(&data)?;
        file.flush()?;
        if self.config.sync_on_write {
            file.get_ref().sync_all()?;
        }
        state.next_index += 1;

        debug!(
            entry_type = ?entry.entry_type,
            index = entry.index,
            height,
            level,
            bytes = data.len(),
            "WAL entry written"
        );
        Ok(())
    }

    /// Record a proposal before acting on it.
    ///
    /// Recording the same block twice for a (height, level) is a no-op; a
    /// different block is rejected.
    pub fn write_proposal(&self, proposal: &ProposalData) -> WalResult<()> {
        let key = (proposal.height, proposal.level);
        let block_hash = proposal.block.hash();
        let mut state = self.state.lock();
        if let Some(existing) = state.proposals.get(&key) {
            if *existing != block_hash {
                return Err(WalError::EquivocationDetected {
                    height: proposal.height,
                    level: proposal.level,
                    existing: *existing,
                });
            }
            return Ok(());
        }
        let payload = bincode::serialize(proposal)?;
        self.write_entry(
            &mut state,
            WalEntryType::Proposal,
            proposal.height,
            proposal.level,
            payload,
        )?;
        state.proposals.insert(key, block_hash);
        Ok(())
    }

    /// Record an own vote. MUST be called BEFORE signing.
    ///
    /// Returns an error if a different vote of the same kind was already
    /// recorded for this (height, level).
    pub fn write_vote(&self, vote: &Vote) -> WalResult<()> {
        let key = (vote.height, vote.level, vote.new_view);
        let mut state = self.state.lock();
        if let Some(existing) = state.own_votes.get(&key) {
            if *existing != vote.block_id {
                return Err(WalError::EquivocationDetected {
                    height: vote.height,
                    level: vote.level,
                    existing: *existing,
                });
            }
            return Ok(());
        }
        let mut unsigned = vote.clone();
        unsigned.endorsement = None;
        let payload = bincode::serialize(&unsigned)?;
        self.write_entry(&mut state, WalEntryType::Vote, vote.height, vote.level, payload)?;
        state.own_votes.insert(key, vote.block_id);
        Ok(())
    }

    /// Record a block commit.
    pub fn write_committed(&self, height: u64, block_hash: Hash) -> WalResult<()> {
        let mut state = self.state.lock();
        if height <= state.committed_height {
            return Ok(());
        }
        self.write_entry(
            &mut state,
            WalEntryType::Committed,
            height,
            0,
            block_hash.to_vec(),
        )?;
        state.committed_height = state.committed_height.max(height);
        Ok(())
    }

    /// Block hash of the own vote at (height, level), if one was recorded.
    pub fn signed_vote(&self, height: u64, level: u64, new_view: bool) -> Option<Hash> {
        self.state
            .lock()
            .own_votes
            .get(&(height, level, new_view))
            .copied()
    }

    /// Highest level this node cast a block vote at.
    pub fn last_voted_level(&self) -> u64 {
        self.state
            .lock()
            .own_votes
            .keys()
            .filter(|(_, _, new_view)| !new_view)
            .map(|(_, level, _)| *level)
            .max()
            .unwrap_or(0)
    }

    /// Highest committed height recorded.
    pub fn committed_height(&self) -> u64 {
        self.state.lock().committed_height
    }

    /// Index the next entry will get.
    pub fn next_index(&self) -> u64 {
        self.state.lock().next_index
    }

    /// In-flight proposals and votes above the committed height, in write
    /// order.
    pub fn replay_wal(&self) -> WalResult<Vec<WalRecord>> {
        self.flush()?;
        let path = self.path();
        let committed = self.committed_height();
        let scan = scan_file(&path, false)?;

        let mut records = Vec::new();
        for entry in scan.entries {
            if entry.height <= committed {
                continue;
            }
            match entry.entry_type {
                WalEntryType::Proposal => {
                    records.push(WalRecord::Proposal(bincode::deserialize(&entry.payload)?));
                }
                WalEntryType::Vote => {
                    records.push(WalRecord::Vote(bincode::deserialize(&entry.payload)?));
                }
                WalEntryType::Committed => {}
            }
        }
        info!(committed, records = records.len(), "Replaying WAL");
        Ok(records)
    }

    /// Drop entries below `min_height`.
    ///
    /// Writes the kept entries to a temporary file and renames it over the
    /// WAL, so a crash leaves either the old or the new file.
    pub fn prune(&self, min_height: u64) -> WalResult<()> {
        let wal_path = self.path();
        let temp_path = self.config.dir.join(WAL_TMP_FILE);

        let mut state = self.state.lock();
        let mut file_guard = self.file.lock();
        if let Some(mut f) = file_guard.take() {
            f.flush()?;
        }

        let scan = scan_file(&wal_path, false)?;
        let mut new_file = BufWriter::new(File::create(&temp_path)?);
        let mut pruned_count = 0usize;
        let mut kept_count = 0usize;
        for entry in &scan.entries {
            if entry.height >= min_height {
                new_file.write_all(&entry.to_bytes())?;
                kept_count += 1;
            } else {
                pruned_count += 1;
            }
        }
        new_file.flush()?;
        new_file.get_ref().sync_all()?;
        drop(new_file);

        std::fs::rename(&temp_path, &wal_path)?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&wal_path)?;
        *file_guard = Some(BufWriter::new(file));
        state.retain_from(min_height);

        if pruned_count > 0 {
            debug!(min_height, pruned_count, kept_count, "WAL pruned");
        }
        Ok(())
    }

    /// Flush and close the WAL. Later writes fail with [`WalError::Closed`].
    pub fn close(&self) -> WalResult<()> {
        let mut file_guard = self.file.lock();
        if let Some(mut f) = file_guard.take() {
            f.flush()?;
            f.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Flush any buffered writes
    pub fn flush(&self) -> WalResult<()> {
        let mut file_guard = self.file.lock();
        if let Some(f) = file_guard.as_mut() {
            f.flush()?;
            if self.config.sync_on_write {
                f.get_ref().sync_all()?;
            }
        }
        Ok(())
    }

    /// Current WAL file size
    pub fn file_size(&self) -> WalResult<u64> {
        Ok(std::fs::metadata(self.path())?.len())
    }

    /// Get the configuration
    pub fn config(&self) -> &WalConfig {
        &self.config
    }
}

impl Drop for ConsensusWal {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("Error closing WAL: {}", e);
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

/// CRC32 checksum (IEEE polynomial)
fn crc32_checksum(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = generate_crc32_table();
    let mut crc = 0xFFFF_FFFFu32;
    for byte in data {
        let index = ((crc ^ (*byte as u32)) & 0xFF) as usize;
        crc = TABLE[index] ^ (crc >> 8);
    }
    !crc
}

/// Generate CRC32 lookup table at compile time
const fn generate_crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB8_8320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_checksum() {
        assert_eq!(crc32_checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_entry_header_layout() {
        let entry = WalEntry {
            entry_type: WalEntryType::Committed,
            index: 7,
            height: 9,
            level: 0,
            payload: vec![1, 2, 3],
        };
        let bytes = entry.to_bytes();
        assert_eq!(bytes.len(), entry.serialized_size());
        assert_eq!(&bytes[0..4], &WAL_MAGIC);
        assert_eq!(bytes[5], WalEntryType::Committed as u8);
        assert_eq!(read_u64(&bytes[6..14]), 7);
        assert_eq!(read_u64(&bytes[14..22]), 9);
        assert_eq!(WalEntry::from_bytes(&bytes, 0).unwrap(), entry);
    }

    #[test]
    fn test_corrupted_entry_detection() {
        let entry = WalEntry {
            entry_type: WalEntryType::Vote,
            index: 0,
            height: 100,
            level: 3,
            payload: vec![0xAB; 16],
        };
        let mut bytes = entry.to_bytes();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        assert!(matches!(
            WalEntry::from_bytes(&bytes, 0),
            Err(WalError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_unknown_entry_type() {
        let mut bytes = WalEntry {
            entry_type: WalEntryType::Vote,
            index: 0,
            height: 1,
            level: 1,
            payload: Vec::new(),
        }
        .to_bytes();
        bytes[5] = 42;
        assert!(matches!(
            WalEntry::from_bytes(&bytes, 0),
            Err(WalError::Corrupted { .. })
        ));
    }
}
