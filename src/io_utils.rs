//! File-level I/O helpers shared by sources and writers.
//!
//! - **Source validation**: existence, regular-file and size checks that turn
//!   filesystem problems into `SourceUnavailable` before a job starts.
//! - **Encoding**: detection along the UTF-8, UTF-8 with BOM, Latin-1 chain
//!   and decoding readers built on `encoding_rs_io`.
//! - **Delimiters**: extension-based resolution (`.tsv` uses tab).
//! - **Committed appends**: [`CommittedFile`] rolls a file back to its last
//!   committed length on a failed write, so flat-file outputs only ever hold
//!   whole rows.

use std::{
    fs::{self, File},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE, WINDOWS_1252};
use encoding_rs_io::DecodeReaderBytesBuilder;
use log::debug;

use crate::error::{ConvertError, Result};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const SCAN_CHUNK: usize = 64 * 1024;

pub fn display_path(path: &Path) -> String {
    path.display().to_string()
}

fn unavailable(path: &Path, err: &io::Error) -> ConvertError {
    ConvertError::SourceUnavailable(format!("{}: {err}", display_path(path)))
}

/// Checks a source file before anything is read from it and returns its size.
pub fn validate_source_file(path: &Path, max_bytes: u64) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|err| unavailable(path, &err))?;
    if !metadata.is_file() {
        return Err(ConvertError::SourceUnavailable(format!(
            "{} is not a regular file",
            display_path(path)
        )));
    }
    File::open(path).map_err(|err| unavailable(path, &err))?;
    if metadata.len() > max_bytes {
        return Err(ConvertError::Validation(format!(
            "{} is {} MiB, above the {} MiB limit",
            display_path(path),
            metadata.len() / (1024 * 1024),
            max_bytes / (1024 * 1024)
        )));
    }
    Ok(metadata.len())
}

pub fn open_source(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| unavailable(path, &err))
}

/// Looks up an encoding by its WHATWG label (`utf-8`, `latin1`, `cp1252`...).
pub fn resolve_encoding(label: &str) -> Result<&'static Encoding> {
    Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| ConvertError::Config(format!("unknown encoding '{label}'")))
}

/// Result of sniffing a text file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectedEncoding {
    pub encoding: &'static Encoding,
    pub bom: bool,
}

impl DetectedEncoding {
    pub fn label(&self) -> String {
        if self.bom && self.encoding == UTF_8 {
            "UTF-8 (BOM)".to_string()
        } else {
            self.encoding.name().to_string()
        }
    }
}

/// Detects a text encoding: UTF-16 BOMs, then UTF-8 with BOM, then strict
/// UTF-8, falling back to Latin-1 (windows-1252). Content with NUL bytes and
/// no BOM is rejected with a decode error suggesting a manual encoding.
pub fn detect_encoding(path: &Path) -> Result<DetectedEncoding> {
    let mut reader = open_source(path)?;
    let mut buffer = vec![0u8; SCAN_CHUNK];
    let mut carry: Vec<u8> = Vec::new();
    let mut first = true;
    let mut valid_utf8 = true;
    let mut bom = false;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let mut chunk = &buffer[..read];
        if first {
            first = false;
            if chunk.starts_with(&[0xFF, 0xFE]) {
                return Ok(DetectedEncoding {
                    encoding: UTF_16LE,
                    bom: true,
                });
            }
            if chunk.starts_with(&[0xFE, 0xFF]) {
                return Ok(DetectedEncoding {
                    encoding: UTF_16BE,
                    bom: true,
                });
            }
            if chunk.starts_with(UTF8_BOM) {
                bom = true;
                chunk = &chunk[UTF8_BOM.len()..];
            }
        }
        if chunk.contains(&0) {
            return Err(ConvertError::Decode {
                path: display_path(path),
                message: "file contains NUL bytes; it is binary or uses a wide encoding"
                    .to_string(),
                suggestions: vec!["utf-16le".to_string(), "utf-16be".to_string()],
            });
        }
        if valid_utf8 {
            carry.extend_from_slice(chunk);
            match std::str::from_utf8(&carry) {
                Ok(_) => carry.clear(),
                Err(err) if err.error_len().is_none() => {
                    // Sequence split across chunks; keep the tail for the next read.
                    let tail = carry.split_off(err.valid_up_to());
                    carry = tail;
                }
                Err(_) => valid_utf8 = false,
            }
        }
    }
    if !carry.is_empty() {
        valid_utf8 = false;
    }

    let detected = if valid_utf8 {
        DetectedEncoding {
            encoding: UTF_8,
            bom,
        }
    } else {
        DetectedEncoding {
            encoding: WINDOWS_1252,
            bom: false,
        }
    };
    debug!("Detected encoding {} for {path:?}", detected.label());
    Ok(detected)
}

/// Opens a reader yielding UTF-8 regardless of the file's encoding; any BOM is stripped.
pub fn open_decoded(path: &Path, encoding: &'static Encoding) -> Result<Box<dyn Read + Send>> {
    let file = open_source(path)?;
    let reader = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding))
        .bom_override(true)
        .strip_bom(true)
        .build(file);
    Ok(Box::new(reader))
}

pub fn resolve_input_delimiter(path: &Path, provided: Option<u8>) -> u8 {
    provided.unwrap_or_else(|| match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("tsv") => DEFAULT_TSV_DELIMITER,
        _ => DEFAULT_CSV_DELIMITER,
    })
}

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// An append-only file that can be rolled back to its last committed length.
#[derive(Debug)]
pub struct CommittedFile {
    path: PathBuf,
    file: File,
    committed: u64,
}

impl CommittedFile {
    pub fn create(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let file = File::create(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            committed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn committed_len(&self) -> u64 {
        self.committed
    }

    /// Appends `bytes` as one unit. On failure the file is cut back to the
    /// previous commit point before the error is returned.
    pub fn commit(&mut self, bytes: &[u8]) -> io::Result<()> {
        let written = self.file.write_all(bytes).and_then(|()| self.file.flush());
        match written {
            Ok(()) => {
                self.committed += bytes.len() as u64;
                Ok(())
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    pub fn rollback(&mut self) -> io::Result<()> {
        self.file.set_len(self.committed)?;
        self.file.seek(SeekFrom::Start(self.committed))?;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn detects_bom_utf8_and_latin1() {
        let dir = tempdir().unwrap();
        let bom = dir.path().join("bom.csv");
        fs::write(&bom, b"\xEF\xBB\xBFid,name\n1,caf\xC3\xA9\n").unwrap();
        let plain = dir.path().join("plain.csv");
        fs::write(&plain, "id,name\n1,café\n").unwrap();
        let latin = dir.path().join("latin.csv");
        fs::write(&latin, b"id,name\n1,caf\xE9\n").unwrap();

        let detected = detect_encoding(&bom).unwrap();
        assert_eq!((detected.encoding, detected.bom), (UTF_8, true));
        assert_eq!(detect_encoding(&plain).unwrap().encoding, UTF_8);
        assert_eq!(detect_encoding(&latin).unwrap().encoding, WINDOWS_1252);
    }

    #[test]
    fn nul_bytes_raise_decode_error_with_suggestions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wide.csv");
        fs::write(&path, b"i\0d\0\n\0").unwrap();
        match detect_encoding(&path) {
            Err(ConvertError::Decode { suggestions, .. }) => {
                assert!(suggestions.contains(&"utf-16le".to_string()));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }

    #[test]
    fn decoded_reader_strips_bom_and_transcodes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latin.csv");
        fs::write(&path, b"caf\xE9").unwrap();
        let mut text = String::new();
        open_decoded(&path, WINDOWS_1252)
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "café");
    }

    #[test]
    fn missing_source_is_unavailable_and_oversized_is_rejected() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.mdb");
        assert!(matches!(
            validate_source_file(&missing, 1024),
            Err(ConvertError::SourceUnavailable(_))
        ));
        assert!(matches!(
            validate_source_file(dir.path(), 1024),
            Err(ConvertError::SourceUnavailable(_))
        ));
        let big = dir.path().join("big.csv");
        fs::write(&big, vec![b'a'; 2048]).unwrap();
        assert!(matches!(
            validate_source_file(&big, 1024),
            Err(ConvertError::Validation(_))
        ));
    }

    #[test]
    fn committed_file_rolls_back_to_last_commit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("t.csv");
        let mut file = CommittedFile::create(&path).unwrap();
        file.commit(b"id\n1\n").unwrap();
        file.file.write_all(b"2,partial").unwrap();
        file.rollback().unwrap();
        file.commit(b"3\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "id\n1\n3\n");
    }

    #[test]
    fn tsv_extension_selects_tab() {
        assert_eq!(resolve_input_delimiter(Path::new("a.TSV"), None), b'\t');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), None), b',');
        assert_eq!(resolve_input_delimiter(Path::new("a.csv"), Some(b';')), b';');
    }
}
