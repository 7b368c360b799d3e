use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::DestinationStore;
use crate::error::StoreError;
use crate::models::Destination;

#[derive(Serialize, Deserialize)]
struct Document {
    #[serde(flatten)]
    destination: Destination,
    fingerprint: String,
}

/// Append-only JSON-lines file, one document per destination.
pub struct DocumentStore {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl DocumentStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }
}

impl DestinationStore for DocumentStore {
    fn name(&self) -> &'static str {
        "document"
    }

    fn record_destination(&self, destination: &Destination) -> Result<(), StoreError> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(StoreError::Closed)?;
        let doc = Document {
            destination: destination.clone(),
            fingerprint: destination.fingerprint(),
        };
        serde_json::to_writer(&mut *writer, &doc)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    fn recent(&self, limit: usize) -> Result<Vec<Destination>, StoreError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut all = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: Document = serde_json::from_str(&line)?;
            all.push(doc.destination);
        }
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    fn close(&self) -> Result<(), StoreError> {
        if let Some(mut writer) = self.writer.lock().take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Protocol;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_appends_one_document_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("destinations.jsonl");
        let store = DocumentStore::open(&path).unwrap();

        let a = Destination::new(
            Protocol::Http,
            "a.example",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            None,
            Utc::now(),
        );
        let b = Destination::new(
            Protocol::TlsSsl,
            "b.example",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))),
            Utc::now(),
        );
        store.record_destination(&a).unwrap();
        store.record_destination(&b).unwrap();
        store.close().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["protocol"], "HTTP");
        assert_eq!(first["server_name"], "a.example");
        assert_eq!(first["fingerprint"], a.fingerprint());

        assert_eq!(store.recent(1).unwrap(), vec![b]);
        assert!(matches!(store.record_destination(&a), Err(StoreError::Closed)));
    }
}
