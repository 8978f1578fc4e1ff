#![forbid(unsafe_code)]
//! Write-ahead log of committed page images.
//!
//! Each file transaction appends the after-image of every page it touched as
//! one frame per page. The last frame of a transaction carries the number of
//! frames in the transaction; recovery only replays frames up to the last such
//! commit marker, so a torn tail from a crash mid-append is ignored. Frames
//! are chained: each header stores a checksum over the previous frame, which
//! stops replay at leftovers from an earlier log incarnation.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::io::FileIo;
use crate::types::{Checksum, Crc32Fast, IndexError, Lsn, PageId, Result};

const WAL_MAGIC: [u8; 4] = *b"XRFW";
const WAL_FORMAT_VERSION: u16 = 1;
const FILE_HEADER_LEN: usize = 32;
const FRAME_HEADER_LEN: usize = 32;

/// Parameters fixed for the lifetime of a log file.
#[derive(Clone, Debug)]
pub struct WalOptions {
    /// Size of each page image in bytes.
    pub page_size: u32,
    /// Random salt tying the log to its data file.
    pub wal_salt: u64,
    /// First LSN the log may contain.
    pub start_lsn: Lsn,
}

/// Counters for the current log incarnation.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct WalStats {
    /// Page frames written.
    pub frames_appended: u64,
    /// Commit frames written.
    pub commits_appended: u64,
    /// Bytes written, headers included.
    pub bytes_appended: u64,
    /// Fsyncs of the log file.
    pub syncs: u64,
}

#[derive(Clone, Debug)]
struct FileHeader {
    page_size: u32,
    wal_salt: u64,
    start_lsn: Lsn,
}

impl FileHeader {
    fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&WAL_MAGIC);
        buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..20].copy_from_slice(&self.wal_salt.to_be_bytes());
        buf[20..28].copy_from_slice(&self.start_lsn.0.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8; FILE_HEADER_LEN]) -> Result<Self> {
        if src[0..4] != WAL_MAGIC {
            return Err(IndexError::Corruption("wal magic mismatch"));
        }
        if be_u16(&src[4..6]) != WAL_FORMAT_VERSION {
            return Err(IndexError::Corruption("wal format version mismatch"));
        }
        if src[6..8] != [0, 0] {
            return Err(IndexError::Corruption("wal reserved header bytes non-zero"));
        }
        if be_u32(&src[28..32]) != crc32fast::hash(&src[..28]) {
            return Err(IndexError::Corruption("wal header crc mismatch"));
        }
        Ok(Self {
            page_size: be_u32(&src[8..12]),
            wal_salt: be_u64(&src[12..20]),
            start_lsn: Lsn(be_u64(&src[20..28])),
        })
    }

    fn chain_seed(&self) -> u32 {
        let mut hasher = Crc32Fast::default();
        hasher.update(&self.wal_salt.to_be_bytes());
        hasher.update(&self.start_lsn.0.to_be_bytes());
        hasher.finalize()
    }
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    page_id: PageId,
    chain: u32,
    commit_frames: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.page_id.0.to_be_bytes());
        buf[16..20].copy_from_slice(&self.chain.to_be_bytes());
        buf[20..24].copy_from_slice(&self.commit_frames.to_be_bytes());
        buf[24..28].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let crc = crc32fast::hash(&buf[..28]);
        buf[28..32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Option<Self> {
        if src.len() < FRAME_HEADER_LEN || be_u32(&src[28..32]) != crc32fast::hash(&src[..28]) {
            return None;
        }
        Some(Self {
            lsn: Lsn(be_u64(&src[0..8])),
            page_id: PageId(be_u64(&src[8..16])),
            chain: be_u32(&src[16..20]),
            commit_frames: be_u32(&src[20..24]),
            payload_crc32: be_u32(&src[24..28]),
        })
    }

    fn next_chain(&self) -> u32 {
        let mut hasher = Crc32Fast::default();
        hasher.update(&self.chain.to_be_bytes());
        hasher.update(&self.page_id.0.to_be_bytes());
        hasher.update(&self.payload_crc32.to_be_bytes());
        hasher.finalize()
    }
}

/// Page image recovered from the log.
pub struct WalFrameOwned {
    /// Commit LSN of the frame.
    pub lsn: Lsn,
    /// Page the image belongs to.
    pub page_id: PageId,
    /// Full page image.
    pub payload: Vec<u8>,
}

impl fmt::Debug for WalFrameOwned {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalFrameOwned")
            .field("lsn", &self.lsn)
            .field("page_id", &self.page_id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Append-only log file. Owned by the single writer; no internal locking.
pub struct Wal {
    io: Arc<dyn FileIo>,
    page_size: usize,
    header: FileHeader,
    append_offset: u64,
    chain: u32,
    unsynced: bool,
    stats: WalStats,
}

impl Wal {
    /// Opens the log, creating an empty one when the file is new. An existing
    /// log must match the page size and salt of its data file.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        if options.page_size == 0 {
            return Err(IndexError::Invalid("wal page size must be non-zero"));
        }
        let len = io.len()?;
        let header = if len < FILE_HEADER_LEN as u64 {
            let header = FileHeader {
                page_size: options.page_size,
                wal_salt: options.wal_salt,
                start_lsn: options.start_lsn,
            };
            io.write_at(0, &header.encode())?;
            io.truncate(FILE_HEADER_LEN as u64)?;
            header
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let header = FileHeader::decode(&buf)?;
            if header.page_size != options.page_size {
                return Err(IndexError::Corruption("wal page size mismatch"));
            }
            if header.wal_salt != options.wal_salt {
                return Err(IndexError::Corruption("wal salt mismatch"));
            }
            header
        };
        let chain = header.chain_seed();
        Ok(Self {
            io,
            page_size: options.page_size as usize,
            header,
            append_offset: len.max(FILE_HEADER_LEN as u64),
            chain,
            unsynced: false,
            stats: WalStats::default(),
        })
    }

    /// Appends the frames of one transaction. The last frame carries the
    /// commit marker. Does not sync.
    pub fn append_commit(&mut self, lsn: Lsn, frames: &[(PageId, &[u8])]) -> Result<()> {
        if frames.is_empty() {
            return Ok(());
        }
        if lsn < self.header.start_lsn {
            return Err(IndexError::Invalid("wal frame lsn below start_lsn"));
        }
        let frame_size = FRAME_HEADER_LEN + self.page_size;
        let mut buf = Vec::with_capacity(frames.len() * frame_size);
        let mut chain = self.chain;
        for (idx, (page_id, payload)) in frames.iter().enumerate() {
            if payload.len() != self.page_size {
                return Err(IndexError::Invalid("wal frame payload size mismatch"));
            }
            let header = FrameHeader {
                lsn,
                page_id: *page_id,
                chain,
                commit_frames: if idx + 1 == frames.len() {
                    frames.len() as u32
                } else {
                    0
                },
                payload_crc32: crc32fast::hash(payload),
            };
            chain = header.next_chain();
            buf.extend_from_slice(&header.encode());
            buf.extend_from_slice(payload);
        }
        self.io.write_at(self.append_offset, &buf)?;
        self.append_offset += buf.len() as u64;
        self.chain = chain;
        self.unsynced = true;
        self.stats.frames_appended += frames.len() as u64;
        self.stats.commits_appended += 1;
        self.stats.bytes_appended += buf.len() as u64;
        debug!(lsn = lsn.0, frames = frames.len(), "wal.append_commit");
        Ok(())
    }

    /// Flushes appended frames to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.io.sync_all()?;
        self.unsynced = false;
        self.stats.syncs += 1;
        Ok(())
    }

    /// Syncs only when frames were appended since the last sync.
    pub fn sync_if_needed(&mut self) -> Result<()> {
        if self.unsynced {
            self.sync()?;
        }
        Ok(())
    }

    /// Discards every frame and starts a new incarnation at `start_lsn`.
    pub fn reset(&mut self, start_lsn: Lsn) -> Result<()> {
        self.header.start_lsn = start_lsn;
        self.io.write_at(0, &self.header.encode())?;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        self.append_offset = FILE_HEADER_LEN as u64;
        self.chain = self.header.chain_seed();
        self.unsynced = false;
        debug!(start_lsn = start_lsn.0, "wal.reset");
        Ok(())
    }

    /// Reads every frame belonging to a complete transaction, in log order.
    /// Scanning stops at the first frame that is torn, fails its checksum or
    /// breaks the chain; frames after the last commit marker are dropped.
    pub fn committed_frames(&self) -> Result<Vec<WalFrameOwned>> {
        let end = self.io.len()?;
        let frame_size = (FRAME_HEADER_LEN + self.page_size) as u64;
        let mut offset = FILE_HEADER_LEN as u64;
        let mut chain = self.header.chain_seed();
        let mut committed = Vec::new();
        let mut pending: Vec<WalFrameOwned> = Vec::new();
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        while offset + frame_size <= end {
            self.io.read_at(offset, &mut header_buf)?;
            let Some(header) = FrameHeader::decode(&header_buf) else {
                break;
            };
            if header.chain != chain {
                break;
            }
            let mut payload = vec![0u8; self.page_size];
            self.io.read_at(offset + FRAME_HEADER_LEN as u64, &mut payload)?;
            if crc32fast::hash(&payload) != header.payload_crc32 {
                break;
            }
            chain = header.next_chain();
            offset += frame_size;
            let commit_frames = header.commit_frames as usize;
            pending.push(WalFrameOwned {
                lsn: header.lsn,
                page_id: header.page_id,
                payload,
            });
            if commit_frames > 0 {
                if commit_frames != pending.len() {
                    warn!(
                        expected = commit_frames,
                        found = pending.len(),
                        "wal.commit_marker_mismatch"
                    );
                    pending.clear();
                    break;
                }
                committed.append(&mut pending);
            }
        }
        if !pending.is_empty() {
            debug!(frames = pending.len(), "wal.discard_uncommitted_tail");
        }
        Ok(committed)
    }

    /// Highest LSN among committed frames, if any.
    pub fn last_committed_lsn(&self) -> Result<Option<Lsn>> {
        Ok(self.committed_frames()?.last().map(|frame| frame.lsn))
    }

    /// First LSN of the current incarnation.
    pub fn start_lsn(&self) -> Lsn {
        self.header.start_lsn
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> WalStats {
        self.stats.clone()
    }

    /// Bytes currently in the log, header included.
    pub fn len(&self) -> u64 {
        self.append_offset
    }

    /// Returns true if the log holds no frames.
    pub fn is_empty(&self) -> bool {
        self.append_offset <= FILE_HEADER_LEN as u64
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    let mut out = [0u8; 2];
    out.copy_from_slice(&bytes[..2]);
    u16::from_be_bytes(out)
}

fn be_u32(bytes: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(out)
}

fn be_u64(bytes: &[u8]) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    const PAGE: usize = 64;

    fn options() -> WalOptions {
        WalOptions {
            page_size: PAGE as u32,
            wal_salt: 0xABCD,
            start_lsn: Lsn(1),
        }
    }

    fn open(path: &std::path::Path) -> (Arc<dyn FileIo>, Wal) {
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(path).unwrap());
        let wal = Wal::open(Arc::clone(&io), options()).unwrap();
        (io, wal)
    }

    #[test]
    fn committed_frames_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.wal");
        {
            let (_, mut wal) = open(&path);
            let a = vec![1u8; PAGE];
            let b = vec![2u8; PAGE];
            wal.append_commit(Lsn(1), &[(PageId(3), &a), (PageId(0), &b)])
                .unwrap();
            wal.append_commit(Lsn(2), &[(PageId(3), &b)]).unwrap();
            wal.sync().unwrap();
        }
        let (_, wal) = open(&path);
        let frames = wal.committed_frames().unwrap();
        let ids: Vec<_> = frames.iter().map(|f| (f.lsn.0, f.page_id.0)).collect();
        assert_eq!(ids, vec![(1, 3), (1, 0), (2, 3)]);
        assert_eq!(frames[2].payload, vec![2u8; PAGE]);
        assert_eq!(wal.last_committed_lsn().unwrap(), Some(Lsn(2)));
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.wal");
        let (io, mut wal) = open(&path);
        let page = vec![5u8; PAGE];
        wal.append_commit(Lsn(1), &[(PageId(1), &page)]).unwrap();
        wal.append_commit(Lsn(2), &[(PageId(1), &page), (PageId(2), &page)])
            .unwrap();
        // Chop the commit marker frame of the second transaction in half.
        let len = io.len().unwrap();
        io.truncate(len - (PAGE as u64 / 2)).unwrap();

        let (_, reopened) = open(&path);
        let frames = reopened.committed_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].lsn, Lsn(1));
    }

    #[test]
    fn flipped_payload_stops_replay() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.wal");
        let (io, mut wal) = open(&path);
        let page = vec![9u8; PAGE];
        wal.append_commit(Lsn(1), &[(PageId(1), &page)]).unwrap();
        wal.append_commit(Lsn(2), &[(PageId(2), &page)]).unwrap();
        let second_payload = (FILE_HEADER_LEN + FRAME_HEADER_LEN + PAGE + FRAME_HEADER_LEN) as u64;
        io.write_at(second_payload + 3, &[0]).unwrap();
        let frames = wal.committed_frames().unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn reset_drops_frames() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.wal");
        let (_, mut wal) = open(&path);
        let page = vec![1u8; PAGE];
        wal.append_commit(Lsn(1), &[(PageId(1), &page)]).unwrap();
        assert!(!wal.is_empty());
        wal.reset(Lsn(2)).unwrap();
        assert!(wal.is_empty());
        assert!(wal.committed_frames().unwrap().is_empty());
        wal.append_commit(Lsn(2), &[(PageId(4), &page)]).unwrap();
        let frames = wal.committed_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].page_id, PageId(4));
    }

    #[test]
    fn salt_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.wal");
        drop(open(&path));
        let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open(&path).unwrap());
        let mut other = options();
        other.wal_salt = 1;
        assert!(matches!(
            Wal::open(io, other),
            Err(IndexError::Corruption("wal salt mismatch"))
        ));
    }
}
