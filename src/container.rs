//! # Binary Container Module
//!
//! On-disk layout for one capture session and the buffered writer that
//! produces it.
//!
//! ## File Structure
//! ```text
//! session_<id>.bin
//! ├── header (28 bytes, little-endian, packed)
//! │   ├── magic            u32  0x45434744 ("ECGD")
//! │   ├── version          u16
//! │   ├── device_id        u16
//! │   ├── session_id       u32
//! │   ├── start_timestamp  u32  seconds
//! │   ├── ecg_rate_hz      u16
//! │   ├── imu_rate_hz      u16
//! │   ├── ecg_samples      u32
//! │   └── imu_samples      u32
//! └── records, acquisition order
//!     ├── ECG: i16 lead I, i16 lead II, i16 lead III
//!     └── IMU: i16 x, i16 y, i16 z
//! ```
//!
//! The header is written with zero counts at open and rewritten in place by
//! `finalize` once the counts are known.

use crate::error::{IntegrityError, StorageError};
use crate::sampling::{SampleRecord, ECG_RECORD_SIZE, IMU_RECORD_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const MAGIC: u32 = 0x4543_4744;
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 28;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    pub version: u16,
    pub device_id: u16,
    pub session_id: u32,
    pub start_timestamp: u32,
    pub ecg_rate_hz: u16,
    pub imu_rate_hz: u16,
    pub ecg_samples: u32,
    pub imu_samples: u32,
}

impl ContainerHeader {
    pub fn new(device_id: u16, session_id: u32, start_timestamp: u32, rates: (u16, u16)) -> Self {
        Self {
            version: FORMAT_VERSION,
            device_id,
            session_id,
            start_timestamp,
            ecg_rate_hz: rates.0,
            imu_rate_hz: rates.1,
            ecg_samples: 0,
            imu_samples: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6..8].copy_from_slice(&self.device_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.session_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.start_timestamp.to_le_bytes());
        out[16..18].copy_from_slice(&self.ecg_rate_hz.to_le_bytes());
        out[18..20].copy_from_slice(&self.imu_rate_hz.to_le_bytes());
        out[20..24].copy_from_slice(&self.ecg_samples.to_le_bytes());
        out[24..28].copy_from_slice(&self.imu_samples.to_le_bytes());
        out
    }

    /// Decode a header; `None` if the magic does not match
    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Option<Self> {
        let u16_at = |at: usize| u16::from_le_bytes([bytes[at], bytes[at + 1]]);
        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };

        if u32_at(0) != MAGIC {
            return None;
        }

        Some(Self {
            version: u16_at(4),
            device_id: u16_at(6),
            session_id: u32_at(8),
            start_timestamp: u32_at(12),
            ecg_rate_hz: u16_at(16),
            imu_rate_hz: u16_at(18),
            ecg_samples: u32_at(20),
            imu_samples: u32_at(24),
        })
    }

    pub fn expected_file_size(&self) -> u64 {
        expected_size(self.ecg_samples as u64, self.imu_samples as u64)
    }
}

/// Header plus the given number of records of each type
pub fn expected_size(ecg_samples: u64, imu_samples: u64) -> u64 {
    HEADER_SIZE as u64 + ecg_samples * ECG_RECORD_SIZE as u64 + imu_samples * IMU_RECORD_SIZE as u64
}

/// Bounded staging area in front of the file
#[derive(Debug)]
pub struct WriteBuffer {
    bytes: Vec<u8>,
    capacity: usize,
}

impl WriteBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn fits(&self, len: usize) -> bool {
        self.bytes.len() + len <= self.capacity
    }

    /// Caller guarantees `fits(data.len())`
    fn push(&mut self, data: &[u8]) {
        debug_assert!(self.fits(data.len()));
        self.bytes.extend_from_slice(data);
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    fn clear(&mut self) {
        self.bytes.clear();
    }
}

/// Storage handle a container is written through
pub trait ContainerFile: Write + Seek + Send {
    /// Make everything written so far durable
    fn sync(&mut self) -> io::Result<()>;
}

impl ContainerFile for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Creates (or truncates) the file backing a new container
pub type FileOpener = fn(&Path) -> io::Result<Box<dyn ContainerFile>>;

/// The `FileOpener` for real storage
pub fn create_file(path: &Path) -> io::Result<Box<dyn ContainerFile>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    Ok(Box::new(file))
}

/// Result of closing a container
#[derive(Debug, Clone)]
pub struct FinalizedContainer {
    pub path: PathBuf,
    /// Header as rewritten by `finalize`
    pub header: ContainerHeader,
    pub size_on_disk: u64,
    /// Size check against the header counts; a mismatch does not block upload
    pub integrity: Result<(), IntegrityError>,
}

/// Writes one session container through a `WriteBuffer`
pub struct ContainerWriter {
    path: PathBuf,
    file: Box<dyn ContainerFile>,
    header: ContainerHeader,
    buffer: WriteBuffer,
    flushes: u64,
}

impl ContainerWriter {
    /// Create the file through `opener` and write the header with zero counts
    pub fn open(
        path: &Path,
        header: ContainerHeader,
        buffer_capacity: usize,
        opener: FileOpener,
    ) -> Result<Self, StorageError> {
        let mut file = opener(path).map_err(|source| StorageError::Create {
            path: path.to_path_buf(),
            source,
        })?;

        let header = ContainerHeader {
            ecg_samples: 0,
            imu_samples: 0,
            ..header
        };
        file.write_all(&header.to_bytes())
            .map_err(|source| StorageError::Write {
                path: path.to_path_buf(),
                source,
            })?;

        log::debug!("Opened container {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            buffer: WriteBuffer::with_capacity(buffer_capacity),
            flushes: 0,
        })
    }

    /// Stage one record, flushing first if it would not fit.
    /// Records are never split across flushes.
    pub fn append(&mut self, record: &SampleRecord) -> Result<(), StorageError> {
        match record {
            SampleRecord::Ecg(r) => self.append_bytes(&r.to_bytes()),
            SampleRecord::Imu(r) => self.append_bytes(&r.to_bytes()),
        }
    }

    fn append_bytes(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if !self.buffer.fits(bytes.len()) {
            self.flush()?;
        }
        self.buffer.push(bytes);
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.file
            .write_all(self.buffer.as_slice())
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.buffer.clear();
        self.flushes += 1;
        Ok(())
    }

    /// Flush residual bytes, rewrite the header with the final counts, close
    /// the file and verify its size.
    pub fn finalize(mut self, ecg_samples: u32, imu_samples: u32) -> Result<FinalizedContainer, StorageError> {
        self.flush()?;

        self.header.ecg_samples = ecg_samples;
        self.header.imu_samples = imu_samples;

        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|source| StorageError::Seek {
                path: self.path.clone(),
                source,
            })?;
        self.file
            .write_all(&self.header.to_bytes())
            .and_then(|_| self.file.sync())
            .map_err(|source| StorageError::Write {
                path: self.path.clone(),
                source,
            })?;

        let size_on_disk = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|source| StorageError::Seek {
                path: self.path.clone(),
                source,
            })?;

        let Self {
            path,
            file,
            header,
            flushes,
            ..
        } = self;
        drop(file);

        let integrity = verify_size(&header, size_on_disk);
        match &integrity {
            Ok(()) => log::info!(
                "Container {} intact ({} bytes in {} writes)",
                path.display(),
                size_on_disk,
                flushes
            ),
            Err(e) => log::warn!("Container {}: {}", path.display(), e),
        }

        Ok(FinalizedContainer {
            path,
            header,
            size_on_disk,
            integrity,
        })
    }
}

pub fn verify_size(header: &ContainerHeader, actual: u64) -> Result<(), IntegrityError> {
    let expected = header.expected_file_size();
    if expected == actual {
        Ok(())
    } else {
        Err(IntegrityError { expected, actual })
    }
}

/// Read and validate the header of a finalized container
pub fn read_header(path: &Path) -> Result<ContainerHeader, StorageError> {
    let mut file = File::open(path).map_err(|source| StorageError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bytes = [0u8; HEADER_SIZE];
    file.read_exact(&mut bytes)
        .map_err(|source| StorageError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    ContainerHeader::from_bytes(&bytes).ok_or_else(|| StorageError::BadHeader {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::{EcgRecord, ImuRecord};
    use crate::testing::open_full_disk;
    use std::fs;
    use tempfile::tempdir;

    fn header() -> ContainerHeader {
        ContainerHeader::new(1, 1_700_000_000, 1_700_000_000, (250, 25))
    }

    fn ecg(v: i16) -> SampleRecord {
        SampleRecord::Ecg(EcgRecord {
            lead_i: v,
            lead_ii: v,
            lead_iii: 0,
        })
    }

    fn imu(v: i16) -> SampleRecord {
        SampleRecord::Imu(ImuRecord {
            accel_x: v,
            accel_y: 0,
            accel_z: 2048,
        })
    }

    #[test]
    fn test_header_layout() {
        let bytes = header().to_bytes();
        assert_eq!(&bytes[0..4], &[0x44, 0x47, 0x43, 0x45]);
        assert_eq!(&bytes[16..18], &250u16.to_le_bytes());
        assert_eq!(ContainerHeader::from_bytes(&bytes), Some(header()));
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut bytes = header().to_bytes();
        bytes[0] = 0;
        assert!(ContainerHeader::from_bytes(&bytes).is_none());
    }

    #[test]
    fn test_open_writes_zero_count_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_1.bin");
        let mut seeded = header();
        seeded.ecg_samples = 99;

        let writer = ContainerWriter::open(&path, seeded, 512, create_file).unwrap();
        drop(writer);

        let on_disk = read_header(&path).unwrap();
        assert_eq!(on_disk.ecg_samples, 0);
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);
    }

    #[test]
    fn test_open_fails_in_missing_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("session_1.bin");
        let result = ContainerWriter::open(&path, header(), 512, create_file);
        assert!(matches!(result, Err(StorageError::Create { .. })));
    }

    #[test]
    fn test_buffer_flushes_before_overflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_1.bin");
        // 20 bytes holds three 6-byte records
        let mut writer = ContainerWriter::open(&path, header(), 20, create_file).unwrap();

        for i in 0..3 {
            writer.append(&ecg(i)).unwrap();
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64);

        // The fourth record does not fit: the first three go out whole
        writer.append(&ecg(3)).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_SIZE as u64 + 18);

        let finalized = writer.finalize(4, 0).unwrap();
        assert_eq!(finalized.size_on_disk, expected_size(4, 0));
    }

    #[test]
    fn test_finalize_rewrites_counts_and_verifies() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_1.bin");
        let mut writer = ContainerWriter::open(&path, header(), 512, create_file).unwrap();

        for i in 0..100 {
            writer.append(&ecg(i)).unwrap();
            if i % 10 == 0 {
                writer.append(&imu(i)).unwrap();
            }
        }

        let finalized = writer.finalize(100, 10).unwrap();
        assert!(finalized.integrity.is_ok());
        assert_eq!(finalized.size_on_disk, expected_size(100, 10));

        let on_disk = read_header(&path).unwrap();
        assert_eq!(on_disk.ecg_samples, 100);
        assert_eq!(on_disk.imu_samples, 10);
    }

    #[test]
    fn test_finalize_reports_count_mismatch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session_1.bin");
        let mut writer = ContainerWriter::open(&path, header(), 512, create_file).unwrap();
        writer.append(&ecg(1)).unwrap();

        let finalized = writer.finalize(2, 0).unwrap();
        assert_eq!(
            finalized.integrity,
            Err(IntegrityError {
                expected: expected_size(2, 0),
                actual: expected_size(1, 0),
            })
        );
    }

    #[test]
    fn test_failed_flush_reports_write_error() {
        let path = Path::new("session_full.bin");
        let mut writer = ContainerWriter::open(path, header(), 12, open_full_disk).unwrap();

        writer.append(&ecg(1)).unwrap();
        writer.append(&ecg(2)).unwrap();
        assert!(matches!(writer.append(&ecg(3)), Err(StorageError::Write { .. })));
    }

    #[test]
    fn test_read_header_rejects_foreign_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.bin");
        fs::write(&path, [0u8; HEADER_SIZE]).unwrap();
        assert!(matches!(read_header(&path), Err(StorageError::BadHeader { .. })));

        fs::write(&path, [0u8; 4]).unwrap();
        assert!(matches!(read_header(&path), Err(StorageError::Read { .. })));
    }
}
