// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

// ============================================================================
// StorageSink Trait
// ============================================================================

/// Persistent-storage capability consumed by the receive engine. One file
/// is open at a time; validated block payloads are appended in order.
pub trait StorageSink: Send {
    fn open(&mut self, name: &str) -> std::io::Result<()>;

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize>;

    fn close(&mut self) -> std::io::Result<()>;
}

// ============================================================================
// Directory-backed Sink
// ============================================================================

/// Writes received files into an output directory.
pub struct DirSink {
    output_dir: PathBuf,
    current_file: Option<File>,
}

impl DirSink {
    pub fn new(output_dir: PathBuf) -> Self {
        DirSink {
            output_dir,
            current_file: None,
        }
    }
}

impl StorageSink for DirSink {
    fn open(&mut self, name: &str) -> std::io::Result<()> {
        // Names come off the wire; keep only the final path component so a
        // hostile header cannot escape the output directory.
        let name = Path::new(name)
            .file_name()
            .ok_or_else(|| std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("unusable filename: {:?}", name),
            ))?;

        let filepath = self.output_dir.join(name);
        self.current_file = Some(File::create(&filepath)?);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match self.current_file {
            Some(ref mut file) => {
                file.write_all(data)?;
                Ok(data.len())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "write with no open file",
            )),
        }
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.current_file = None;
        Ok(())
    }
}

// ============================================================================
// In-memory Sink for Testing
// ============================================================================

/// Received files as (name, content) pairs, shared with the test so it
/// can inspect them after the engine consumed the sink.
#[cfg(test)]
pub type ReceivedFiles = std::sync::Arc<std::sync::Mutex<Vec<(String, Vec<u8>)>>>;

#[cfg(test)]
pub struct MemorySink {
    files: ReceivedFiles,
    open: bool,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        MemorySink {
            files: ReceivedFiles::default(),
            open: false,
        }
    }

    pub fn handle(&self) -> ReceivedFiles {
        self.files.clone()
    }
}

#[cfg(test)]
impl StorageSink for MemorySink {
    fn open(&mut self, name: &str) -> std::io::Result<()> {
        assert!(!self.open, "open while a file is already open");
        self.files.lock().unwrap().push((name.to_string(), Vec::new()));
        self.open = true;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        assert!(self.open, "write with no open file");
        let mut files = self.files.lock().unwrap();
        files.last_mut().unwrap().1.extend_from_slice(data);
        Ok(data.len())
    }

    fn close(&mut self) -> std::io::Result<()> {
        assert!(self.open, "close with no open file");
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_sink_strips_path_components() {
        let temp_dir = std::env::temp_dir();
        let mut sink = DirSink::new(temp_dir.clone());

        sink.open("../../etc/xyrecv_escape.txt").expect("open should succeed");
        sink.write(b"contained").expect("write should succeed");
        sink.close().expect("close should succeed");

        let filepath = temp_dir.join("xyrecv_escape.txt");
        assert!(filepath.exists(), "File should land in the output directory");

        let content = std::fs::read(&filepath).expect("Should read file");
        assert_eq!(content, b"contained");

        std::fs::remove_file(&filepath).ok();
    }

    #[test]
    fn test_dir_sink_rejects_write_without_open() {
        let mut sink = DirSink::new(std::env::temp_dir());
        assert!(sink.write(b"data").is_err());
    }
}
