//! Result persistence

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use crate::protocol::Response;

/// Where verdicts end up.
pub trait ResultSink: Send {
    /// Send the results of `request_id` to `path` instead of the default.
    fn register(&mut self, request_id: u64, path: PathBuf);

    fn record(&mut self, request_id: u64, response: &Response) -> std::io::Result<()>;
}

/// Appends one line per verdict to a file per request
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
    destinations: HashMap<u64, PathBuf>,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            destinations: HashMap::new(),
        }
    }

    pub fn destination(&self, request_id: u64) -> PathBuf {
        self.destinations
            .get(&request_id)
            .cloned()
            .unwrap_or_else(|| self.directory.join(format!("{}-results.txt", request_id)))
    }
}

impl ResultSink for FileSink {
    fn register(&mut self, request_id: u64, path: PathBuf) {
        self.destinations.insert(request_id, path);
    }

    fn record(&mut self, request_id: u64, response: &Response) -> std::io::Result<()> {
        let path = self.destination(request_id);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(
            file,
            "{} {} {}",
            response.value, response.status, response.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_destination() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = FileSink::new(dir.path());
        sink.record(42, &Response::done(1, "ok")).unwrap();
        sink.record(42, &Response::timeout(2)).unwrap();

        let written = std::fs::read_to_string(dir.path().join("42-results.txt")).unwrap();
        assert_eq!(written, "1 done ok\n2 timeout timed out\n");
    }

    #[test]
    fn test_registered_destination() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collatz.txt");
        let mut sink = FileSink::new(dir.path());
        sink.register(7, path.clone());
        sink.record(7, &Response::exception(0, "never reaches 1")).unwrap();

        assert_eq!(sink.destination(7), path);
        assert_eq!(
            std::fs::read_to_string(path).unwrap(),
            "0 exception never reaches 1\n"
        );
        assert!(!dir.path().join("7-results.txt").exists());
    }
}
