//! Append-only archive of fixed-width numeric rows.
//!
//! Each physical file starts with a 64-byte header followed by row-major,
//! little-endian `f64` data:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 8 | magic `SPECVEC\0` |
//! | 8 | 4 | format version |
//! | 16 | 8 | channels (row width) |
//! | 24 | 8 | committed rows |
//! | 32 | 8 | capacity in rows, 0 for unbounded |
//!
//! New rows are written and synced before the header's row count is
//! updated, so a torn append leaves bytes past the committed rows that are
//! ignored and later overwritten. With [`Driver::Family`] the logical archive
//! is split across `<prefix>.000.spectra`, `<prefix>.001.spectra`, ... each
//! holding at most `segment_rows` rows.

use crate::config::Driver;
use crate::error::IngestError;
use crate::logging::RunLog;
use crate::paths::VECTOR_EXT;
use crate::record::Matrix;
use anyhow::{Context, Result};
use std::ffi::OsString;
use std::fs::{File, OpenOptions, remove_file};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 8] = b"SPECVEC\0";
const VERSION: u32 = 1;
/// Size of the per-file header in bytes.
pub const HEADER_LEN: u64 = 64;
const VALUE_LEN: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    channels: u64,
    rows: u64,
    capacity: u64,
}

impl Header {
    fn encode(self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&VERSION.to_le_bytes());
        buf[16..24].copy_from_slice(&self.channels.to_le_bytes());
        buf[24..32].copy_from_slice(&self.rows.to_le_bytes());
        buf[32..40].copy_from_slice(&self.capacity.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; HEADER_LEN as usize]) -> Result<Self, String> {
        if &buf[0..8] != MAGIC {
            return Err("bad magic".into());
        }
        let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if version != VERSION {
            return Err(format!("unsupported version {version}"));
        }
        Ok(Self {
            channels: read_u64(&buf[16..24]),
            rows: read_u64(&buf[24..32]),
            capacity: read_u64(&buf[32..40]),
        })
    }

    fn space(self) -> u64 {
        if self.capacity == 0 {
            u64::MAX
        } else {
            self.capacity.saturating_sub(self.rows)
        }
    }

    /// File offset just past the committed rows, `None` on overflow.
    fn data_end(self) -> Option<u64> {
        byte_span(self.rows, self.channels)?.checked_add(HEADER_LEN)
    }
}

/// Bytes held by `rows` rows of `channels` values.
fn byte_span(rows: u64, channels: u64) -> Option<u64> {
    rows.checked_mul(channels)?.checked_mul(VALUE_LEN)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(bytes);
    u64::from_le_bytes(b)
}

/// A vector archive rooted at an output stem such as `out/prepro_no_blr`.
#[derive(Clone, Debug)]
pub struct VectorStore {
    stem: PathBuf,
    channels: usize,
    driver: Driver,
}

impl VectorStore {
    pub fn new(stem: impl Into<PathBuf>, channels: usize, driver: Driver) -> Self {
        Self {
            stem: stem.into(),
            channels,
            driver,
        }
    }

    #[must_use]
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Physical file for segment `index` (always the single file for
    /// [`Driver::Single`]).
    #[must_use]
    pub fn segment_path(&self, index: usize) -> PathBuf {
        let mut name = OsString::from(self.stem.as_os_str());
        match self.driver {
            Driver::Single => name.push(format!(".{VECTOR_EXT}")),
            Driver::Family { .. } => name.push(format!(".{index:03}.{VECTOR_EXT}")),
        }
        PathBuf::from(name)
    }

    /// Existing segment files, in order.
    #[must_use]
    pub fn segments(&self) -> Vec<PathBuf> {
        match self.driver {
            Driver::Single => {
                let p = self.segment_path(0);
                if p.exists() { vec![p] } else { Vec::new() }
            }
            Driver::Family { .. } => (0..)
                .map(|i| self.segment_path(i))
                .take_while(|p| p.exists())
                .collect(),
        }
    }

    fn capacity(&self) -> u64 {
        match self.driver {
            Driver::Single => 0,
            Driver::Family { segment_rows } => segment_rows,
        }
    }

    fn data_end(header: Header, path: &Path) -> Result<u64> {
        header.data_end().ok_or_else(|| {
            IngestError::CorruptArchive {
                path: path.to_path_buf(),
                reason: format!(
                    "header claims {} rows of {} channels, which overflows",
                    header.rows, header.channels
                ),
            }
            .into()
        })
    }

    fn read_header(&self, file: &mut File, path: &Path) -> Result<Header> {
        let mut buf = [0u8; HEADER_LEN as usize];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut buf))
            .map_err(|e| IngestError::CorruptArchive {
                path: path.to_path_buf(),
                reason: format!("cannot read header: {e}"),
            })?;
        let header = Header::decode(&buf).map_err(|reason| IngestError::CorruptArchive {
            path: path.to_path_buf(),
            reason,
        })?;
        if header.channels != self.channels as u64 {
            return Err(IngestError::ChannelMismatch {
                path: path.to_path_buf(),
                archive: header.channels as usize,
                batch: self.channels,
            }
            .into());
        }
        let len = file.metadata().with_context(|| format!("stat {}", path.display()))?.len();
        if len < Self::data_end(header, path)? {
            return Err(IngestError::CorruptArchive {
                path: path.to_path_buf(),
                reason: format!("{} committed rows but only {len} bytes", header.rows),
            }
            .into());
        }
        Ok(header)
    }

    fn write_header(file: &mut File, header: Header, path: &Path) -> Result<()> {
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(&header.encode()))
            .and_then(|()| file.sync_data())
            .with_context(|| format!("write header of {}", path.display()))
    }

    fn open_segment(path: &Path) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))
    }

    /// Open segment `index`, creating it with an empty header if needed.
    fn open_or_create(&self, index: usize) -> Result<(File, Header, PathBuf)> {
        let path = self.segment_path(index);
        if path.exists() {
            let mut file = Self::open_segment(&path)?;
            let header = self.read_header(&mut file, &path)?;
            return Ok((file, header, path));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        let header = Header {
            channels: self.channels as u64,
            rows: 0,
            capacity: self.capacity(),
        };
        Self::write_header(&mut file, header, &path)?;
        Ok((file, header, path))
    }

    /// Committed rows across every segment.
    ///
    /// # Errors
    /// Fails on unreadable or inconsistent segment headers.
    pub fn row_count(&self) -> Result<u64> {
        let mut total = 0;
        for path in self.segments() {
            let mut file = Self::open_segment(&path)?;
            total += self.read_header(&mut file, &path)?.rows;
        }
        Ok(total)
    }

    /// Append every row of `rows` after the committed tail. Returns the number
    /// of rows written.
    ///
    /// # Errors
    /// A row width different from the archive's is
    /// [`IngestError::ChannelMismatch`]; nothing is written in that case.
    pub fn append(&self, rows: &Matrix) -> Result<u64> {
        if rows.channels() != self.channels {
            return Err(IngestError::ChannelMismatch {
                path: self.segment_path(0),
                archive: self.channels,
                batch: rows.channels(),
            }
            .into());
        }
        if rows.is_empty() {
            return Ok(0);
        }

        let width = self.channels;
        let mut pending = rows.as_slice();
        let mut index = self.segments().len().saturating_sub(1);
        while !pending.is_empty() {
            let (mut file, mut header, path) = self.open_or_create(index)?;
            let space = header.space();
            if space == 0 {
                index += 1;
                continue;
            }
            let take = (pending.len() / width).min(usize::try_from(space).unwrap_or(usize::MAX));
            let (chunk, rest) = pending.split_at(take * width);

            let mut bytes = Vec::with_capacity(chunk.len() * VALUE_LEN as usize);
            for v in chunk {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
            file.seek(SeekFrom::Start(Self::data_end(header, &path)?))
                .and_then(|_| file.write_all(&bytes))
                .and_then(|()| file.sync_data())
                .with_context(|| format!("append rows to {}", path.display()))?;

            header.rows += take as u64;
            Self::write_header(&mut file, header, &path)?;
            pending = rest;
            index += 1;
        }
        Ok(rows.rows() as u64)
    }

    /// Read `count` rows starting at logical row `start`.
    ///
    /// # Errors
    /// Fails when the range runs past the committed rows.
    pub fn read_rows(&self, start: u64, count: u64) -> Result<Matrix> {
        let mut out = Vec::new();
        let mut offset = 0u64;
        let mut remaining = count;
        let mut cursor = start;
        for path in self.segments() {
            if remaining == 0 {
                break;
            }
            let mut file = Self::open_segment(&path)?;
            let header = self.read_header(&mut file, &path)?;
            let seg_end = offset + header.rows;
            if cursor < seg_end {
                let local = cursor - offset;
                let n = remaining.min(header.rows - local);
                let span = |rows| {
                    byte_span(rows, header.channels).ok_or_else(|| IngestError::CorruptArchive {
                        path: path.clone(),
                        reason: format!("row range {local}+{rows} overflows"),
                    })
                };
                let len = usize::try_from(span(n)?)
                    .with_context(|| format!("{n} rows do not fit in memory"))?;
                let mut buf = vec![0u8; len];
                file.seek(SeekFrom::Start(HEADER_LEN + span(local)?))
                    .and_then(|_| file.read_exact(&mut buf))
                    .with_context(|| format!("read rows from {}", path.display()))?;
                out.extend(buf.chunks_exact(VALUE_LEN as usize).map(|c| {
                    let mut b = [0u8; 8];
                    b.copy_from_slice(c);
                    f64::from_le_bytes(b)
                }));
                cursor += n;
                remaining -= n;
            }
            offset = seg_end;
        }
        if remaining > 0 {
            anyhow::bail!(
                "rows {start}..{} requested but the archive holds {offset}",
                start.saturating_add(count)
            );
        }
        Matrix::from_flat(self.channels, out).map_err(|e| {
            IngestError::CorruptArchive {
                path: self.segment_path(0),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Every committed row.
    ///
    /// # Errors
    /// See [`Self::read_rows`].
    pub fn read_all(&self) -> Result<Matrix> {
        let rows = self.row_count()?;
        if rows == 0 {
            return Ok(Matrix::empty(self.channels));
        }
        self.read_rows(0, rows)
    }

    /// Drop committed rows past `rows`. Used only to discard the tail of a
    /// batch whose metadata never landed.
    ///
    /// # Errors
    /// Fails on I/O errors.
    pub fn truncate_to(&self, rows: u64) -> Result<()> {
        let mut offset = 0u64;
        for (i, path) in self.segments().into_iter().enumerate() {
            if i > 0 && offset >= rows {
                remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                continue;
            }
            let mut file = Self::open_segment(&path)?;
            let mut header = self.read_header(&mut file, &path)?;
            let keep = rows.saturating_sub(offset).min(header.rows);
            if keep < header.rows {
                header.rows = keep;
                Self::write_header(&mut file, header, &path)?;
                file.set_len(Self::data_end(header, &path)?)
                    .with_context(|| format!("truncate {}", path.display()))?;
            }
            offset += header.rows;
        }
        Ok(())
    }

    /// Bring the archive back in line with the side-store after a crash.
    ///
    /// More rows than `committed` means a batch was appended but its metadata
    /// never landed: the tail is dropped with a warning. Fewer rows means
    /// committed data is missing, which cannot be repaired.
    ///
    /// # Errors
    /// [`IngestError::ArchiveOutOfSync`] when the archive is short.
    pub fn reconcile(&self, committed: u64, log: &RunLog) -> Result<()> {
        let rows = self.row_count()?;
        if rows > committed {
            log.warn(format!(
                "vector archive has {rows} rows but only {committed} are committed; dropping {} uncommitted rows",
                rows - committed
            ));
            self.truncate_to(committed)?;
        } else if rows < committed {
            return Err(IngestError::ArchiveOutOfSync {
                archive_rows: rows,
                meta_rows: committed,
            }
            .into());
        }
        Ok(())
    }
}
