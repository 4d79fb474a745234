//! Keyed archive of variable-length `[x, y]` trajectories.
//!
//! The file is an append-only log. After an 8-byte magic, every entry is one
//! frame:
//!
//! ```text
//! [payload length: u32 LE][first 8 bytes of SHA-256(payload)][payload]
//! ```
//!
//! where the payload is the postcard encoding of `(key, trajectory)`. The last
//! frame written for a key is the live one, so overwriting a key never
//! touches its siblings. Opening the log rebuilds the key index; a torn frame
//! at the very end (a crashed append) is ignored and overwritten by the next
//! append. A damaged frame with an intact frame anywhere after it is fatal.
//! [`TrajectoryStore::compact`] rewrites the log without superseded frames.

use crate::error::IngestError;
use crate::logging::RunLog;
use crate::record::Trajectory;
use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const MAGIC: &[u8; 8] = b"SPECTRJ1";
const FRAME_HEADER: u64 = 12;

#[derive(Serialize)]
struct EntryRef<'a> {
    key: &'a str,
    trajectory: &'a Trajectory,
}

#[derive(Deserialize)]
struct Entry {
    key: String,
    trajectory: Trajectory,
}

fn checksum(payload: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(payload);
    let mut sum = [0u8; 8];
    sum.copy_from_slice(&digest[..8]);
    sum
}

fn encode_frame(key: &str, trajectory: &Trajectory) -> Result<Vec<u8>> {
    let payload =
        postcard::to_allocvec(&EntryRef { key, trajectory }).context("encode trajectory entry")?;
    let len = u32::try_from(payload.len()).context("trajectory entry too large")?;
    let mut frame = Vec::with_capacity(payload.len() + FRAME_HEADER as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&checksum(&payload));
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Whether `bytes` contain a complete frame with a matching checksum. A
/// damaged frame followed by one is corruption, not a torn append.
fn holds_intact_frame(bytes: &[u8]) -> bool {
    let header = FRAME_HEADER as usize;
    bytes.windows(header).enumerate().any(|(p, head)| {
        let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let start = p + header;
        len > 0
            && bytes
                .get(start..start + len)
                .is_some_and(|payload| checksum(payload) == head[4..12])
    })
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
}

/// An open trajectory archive.
#[derive(Debug)]
pub struct TrajectoryStore {
    path: PathBuf,
    index: HashMap<String, Slot>,
    /// End of the last intact frame.
    end: u64,
    frames: usize,
}

impl TrajectoryStore {
    /// Open the archive at `path`, scanning it if it exists.
    ///
    /// # Errors
    /// [`IngestError::CorruptArchive`] for a bad magic, an undecodable frame,
    /// or a checksum failure before the last frame.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut store = Self {
            path,
            index: HashMap::new(),
            end: 0,
            frames: 0,
        };
        if store.path.exists() {
            store.scan()?;
        }
        Ok(store)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn corrupt(&self, reason: impl Into<String>) -> anyhow::Error {
        IngestError::CorruptArchive {
            path: self.path.clone(),
            reason: reason.into(),
        }
        .into()
    }

    fn scan(&mut self) -> Result<()> {
        let file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let file_len = file
            .metadata()
            .with_context(|| format!("stat {}", self.path.display()))?
            .len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        if file_len < MAGIC.len() as u64 {
            // Crashed while creating the file.
            self.end = 0;
            return Ok(());
        }
        reader
            .read_exact(&mut magic)
            .with_context(|| format!("read {}", self.path.display()))?;
        if &magic != MAGIC {
            return Err(self.corrupt("bad magic"));
        }

        let mut offset = MAGIC.len() as u64;
        let mut head = [0u8; FRAME_HEADER as usize];
        let mut payload = Vec::new();
        while offset < file_len {
            if file_len - offset < FRAME_HEADER {
                break;
            }
            reader
                .read_exact(&mut head)
                .with_context(|| format!("read {}", self.path.display()))?;
            let len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]);
            let frame_end = offset + FRAME_HEADER + u64::from(len);
            if frame_end > file_len {
                let mut rest = Vec::new();
                reader
                    .read_to_end(&mut rest)
                    .with_context(|| format!("read {}", self.path.display()))?;
                if holds_intact_frame(&rest) {
                    return Err(self.corrupt(format!(
                        "frame at offset {offset} claims {len} bytes past the end of the log"
                    )));
                }
                break;
            }
            payload.resize(len as usize, 0);
            reader
                .read_exact(&mut payload)
                .with_context(|| format!("read {}", self.path.display()))?;
            if checksum(&payload) != head[4..12] {
                if frame_end == file_len && !holds_intact_frame(&payload) {
                    break;
                }
                return Err(self.corrupt(format!("checksum mismatch in frame at offset {offset}")));
            }
            let entry: Entry = postcard::from_bytes(&payload)
                .map_err(|e| self.corrupt(format!("undecodable frame at offset {offset}: {e}")))?;
            self.index.insert(entry.key, Slot { offset, len });
            self.frames += 1;
            offset = frame_end;
        }
        self.end = offset;
        Ok(())
    }

    /// Number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Frames in the log, superseded ones included.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    /// Live keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.index.keys().cloned().collect();
        keys.sort();
        keys
    }

    fn read_slot(&self, file: &mut File, slot: Slot) -> Result<Trajectory> {
        let mut payload = vec![0u8; slot.len as usize];
        file.seek(SeekFrom::Start(slot.offset + FRAME_HEADER))
            .and_then(|_| file.read_exact(&mut payload))
            .with_context(|| format!("read {}", self.path.display()))?;
        let entry: Entry = postcard::from_bytes(&payload)
            .map_err(|e| self.corrupt(format!("undecodable frame at offset {}: {e}", slot.offset)))?;
        Ok(entry.trajectory)
    }

    /// The live trajectory for `key`.
    ///
    /// # Errors
    /// Fails on I/O errors or an undecodable frame.
    pub fn get(&self, key: &str) -> Result<Option<Trajectory>> {
        let Some(&slot) = self.index.get(key) else {
            return Ok(None);
        };
        let mut file = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        self.read_slot(&mut file, slot).map(Some)
    }

    /// Write one frame per `(key, trajectory)` pair, in order.
    ///
    /// A key that already has a live entry is overwritten and a warning is
    /// logged, worded by whether the new data is identical to the old.
    /// Returns the number of frames written.
    ///
    /// # Errors
    /// Fails when `keys` and `trajectories` differ in length, or on I/O
    /// errors.
    pub fn append(&mut self, keys: &[String], trajectories: &[Trajectory], log: &RunLog) -> Result<usize> {
        ensure!(
            keys.len() == trajectories.len(),
            "{} keys for {} trajectories",
            keys.len(),
            trajectories.len()
        );
        if keys.is_empty() {
            return Ok(0);
        }

        let mut buf = Vec::new();
        let mut slots = Vec::with_capacity(keys.len());
        let mut offset = if self.end == 0 { MAGIC.len() as u64 } else { self.end };
        let mut pending: HashMap<&str, &Trajectory> = HashMap::new();
        for (key, trajectory) in keys.iter().zip(trajectories) {
            let previous = match pending.get(key.as_str()) {
                Some(t) => Some((*t).clone()),
                None => self.get(key)?,
            };
            match previous {
                Some(old) if old == *trajectory => {
                    log.warn(format!("Overwriting identical trajectory for key {key}"));
                }
                Some(_) => log.warn(format!("Replacing prior trajectory data for key {key}")),
                None => {}
            }
            let frame = encode_frame(key, trajectory)?;
            let len = u32::try_from(frame.len() as u64 - FRAME_HEADER).context("frame too large")?;
            slots.push((key.clone(), Slot { offset, len }));
            offset += frame.len() as u64;
            buf.extend_from_slice(&frame);
            pending.insert(key.as_str(), trajectory);
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        if self.end == 0 {
            file.set_len(0)
                .and_then(|()| file.write_all(MAGIC))
                .with_context(|| format!("initialize {}", self.path.display()))?;
            self.end = MAGIC.len() as u64;
        } else {
            // Drop any torn tail left by a crashed append.
            file.set_len(self.end)
                .with_context(|| format!("truncate {}", self.path.display()))?;
        }
        file.seek(SeekFrom::Start(self.end))
            .and_then(|_| file.write_all(&buf))
            .and_then(|()| file.sync_data())
            .with_context(|| format!("append to {}", self.path.display()))?;

        self.end = offset;
        self.frames += slots.len();
        let written = slots.len();
        self.index.extend(slots);
        Ok(written)
    }

    /// Rewrite the log keeping only the live frame of each key.
    ///
    /// # Errors
    /// Fails on I/O errors; the old log stays in place in that case.
    pub fn compact(&mut self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp file in {}", dir.display()))?;

        let mut live: Vec<(&String, Slot)> = self.index.iter().map(|(k, s)| (k, *s)).collect();
        live.sort_by_key(|(_, s)| s.offset);

        let mut src = File::open(&self.path).with_context(|| format!("open {}", self.path.display()))?;
        let mut index = HashMap::with_capacity(live.len());
        let mut offset = MAGIC.len() as u64;
        {
            let mut out = BufWriter::new(tmp.as_file_mut());
            out.write_all(MAGIC).context("write compacted log")?;
            for (key, slot) in &live {
                let trajectory = self.read_slot(&mut src, *slot)?;
                let frame = encode_frame(key, &trajectory)?;
                out.write_all(&frame).context("write compacted log")?;
                index.insert((*key).clone(), Slot { offset, len: slot.len });
                offset += frame.len() as u64;
            }
            out.flush().context("flush compacted log")?;
        }
        tmp.as_file()
            .sync_all()
            .with_context(|| format!("sync {}", tmp.path().display()))?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replace {}", self.path.display()))?;

        self.frames = index.len();
        self.index = index;
        self.end = offset;
        Ok(())
    }
}
