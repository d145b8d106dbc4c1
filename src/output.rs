use formatx::formatx;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::fs::File;
use std::io;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Destination for the translator's document-level artifacts (the updated
/// audit document, the run summary). Location keys name the artifact, not the
/// path; the implementation decides where bytes actually go.
pub trait Output: Debug {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write>;
    /// Whether this output can be considered a no-op and therefore that any code that only writes to the output can be skipped.
    fn is_noop(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct FileOutput {
    directory_path: PathBuf,
    file_template: String,
}

impl FileOutput {
    pub fn new(directory_path: PathBuf, file_template: String) -> Self {
        Self {
            directory_path,
            file_template,
        }
    }
}

impl Output for FileOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        let file_name = formatx!(&self.file_template, location_key)
            .map_err(|template_error| anyhow::anyhow!("bad output file template: {template_error}"))?;
        Ok(BufWriter::new(File::create(
            self.directory_path.join(file_name),
        )?))
    }
}

impl Output for &FileOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        <FileOutput as Output>::writer_for_location_key(self, location_key)
    }
}

/// An output that goes to nowhere/ a "sink"/ /dev/null.
#[derive(Debug, Default)]
pub struct SinkOutput;

impl Output for SinkOutput {
    fn writer_for_location_key(&self, _location_key: &str) -> anyhow::Result<impl Write> {
        Ok(io::sink())
    }

    fn is_noop(&self) -> bool {
        true
    }
}

/// An output backed by in-memory buffers, keyed by location key. Cloning
/// shares the underlying buffers, so a test can keep a handle while the
/// translator writes through its own clone.
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutput {
    files: Arc<Mutex<IndexMap<String, Vec<u8>>>>,
}

impl InMemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self, location_key: &str) -> Option<String> {
        self.files
            .lock()
            .get(location_key)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn location_keys(&self) -> Vec<String> {
        self.files.lock().keys().cloned().collect()
    }
}

#[derive(Debug)]
pub struct InMemoryWriter {
    files: Arc<Mutex<IndexMap<String, Vec<u8>>>>,
    location_key: String,
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.files
            .lock()
            .entry(self.location_key.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Output for InMemoryOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        Ok(InMemoryWriter {
            files: Arc::clone(&self.files),
            location_key: location_key.to_string(),
        })
    }
}

impl Output for &InMemoryOutput {
    fn writer_for_location_key(&self, location_key: &str) -> anyhow::Result<impl Write> {
        <InMemoryOutput as Output>::writer_for_location_key(self, location_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::*;

    #[rstest]
    fn in_memory_output_collects_writes_by_key() {
        let output = InMemoryOutput::new();
        {
            let mut writer = output.writer_for_location_key("summary").unwrap();
            writer.write_all(b"a,b,c\n").unwrap();
            writer.write_all(b"1,2,3\n").unwrap();
        }
        assert_eq!(output.contents("summary").as_deref(), Some("a,b,c\n1,2,3\n"));
        assert_eq!(output.location_keys(), vec!["summary".to_string()]);
        assert_eq!(output.contents("missing"), None);
    }

    #[rstest]
    fn file_output_renders_template_into_directory() {
        let dir = tempfile::tempdir().unwrap();
        let output = FileOutput::new(dir.path().to_path_buf(), "audit_{}.xml".to_string());
        output
            .writer_for_location_key("translated")
            .unwrap()
            .write_all(b"<BuildingSync/>")
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("audit_translated.xml")).unwrap();
        assert_eq!(written, "<BuildingSync/>");
    }

    #[rstest]
    fn sink_output_is_a_noop() {
        assert!(SinkOutput.is_noop());
        assert!(!InMemoryOutput::new().is_noop());
    }
}
