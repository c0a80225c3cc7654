//! Streaming ingestion of newline-delimited JSON data files.
//!
//! `RecordStream` walks the supplied files strictly in order and yields valid
//! records lazily, so the tokenizer pulls rows while files are still being
//! read. Per-file outcomes are pushed to an [`IngestObserver`]; cross-file
//! totals and any fatal I/O error are exposed through a shared
//! [`IngestReport`].

use crate::dataset::{ParsedLine, RowRejection, TrainingRecord, parse_line};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::iter::FusedIterator;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One input file, identified by its position in the supplied list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSource {
    pub index: usize,
    pub filename: String,
    pub path: PathBuf,
}

/// Receives per-file ingestion events.
pub trait IngestObserver: Send + Sync {
    fn file_started(&self, index: usize, filename: &str);

    /// The file is absent or could not be read.
    fn file_failed(&self, index: usize, filename: &str);

    fn row_loaded(&self, _index: usize) {}

    fn row_skipped(&self, index: usize, filename: &str, line: usize, reason: &RowRejection);

    fn file_completed(&self, index: usize, filename: &str, rows_loaded: u64, rows_skipped: u64);
}

#[derive(Debug, Default)]
struct IngestState {
    rows_loaded: AtomicU64,
    rows_skipped: AtomicU64,
    files_done: AtomicUsize,
    exhausted: AtomicBool,
    error: Mutex<Option<std::io::Error>>,
}

/// Shared view of a stream's totals, readable after the stream is consumed.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    state: Arc<IngestState>,
}

impl IngestReport {
    #[must_use]
    pub fn rows_loaded(&self) -> u64 {
        self.state.rows_loaded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn rows_skipped(&self) -> u64 {
        self.state.rows_skipped.load(Ordering::SeqCst)
    }

    /// Files completed or found missing.
    #[must_use]
    pub fn files_done(&self) -> usize {
        self.state.files_done.load(Ordering::SeqCst)
    }

    /// True once every file has been read to the end.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.state.exhausted.load(Ordering::SeqCst)
    }

    /// Takes the I/O error that stopped the stream, if any.
    pub fn take_error(&self) -> Option<std::io::Error> {
        self.state.error.lock().ok().and_then(|mut slot| slot.take())
    }

    fn record_error(&self, error: std::io::Error) {
        if let Ok(mut slot) = self.state.error.lock() {
            slot.get_or_insert(error);
        }
    }
}

struct OpenFile {
    source: IngestSource,
    reader: BufReader<File>,
    line_no: usize,
    loaded: u64,
    skipped: u64,
}

/// Lazy iterator over the valid records of all input files.
pub struct RecordStream {
    pending: VecDeque<IngestSource>,
    current: Option<OpenFile>,
    observer: Arc<dyn IngestObserver>,
    cancel: Option<CancellationToken>,
    report: IngestReport,
    finished: bool,
    buf: String,
}

impl RecordStream {
    #[must_use]
    pub fn new(sources: Vec<IngestSource>, observer: Arc<dyn IngestObserver>) -> Self {
        Self {
            pending: sources.into(),
            current: None,
            observer,
            cancel: None,
            report: IngestReport::default(),
            finished: false,
            buf: String::new(),
        }
    }

    /// Stops yielding records once `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn report(&self) -> IngestReport {
        self.report.clone()
    }

    fn stop(&mut self, error: Option<std::io::Error>) {
        if let Some(error) = error {
            self.report.record_error(error);
        }
        self.finished = true;
        self.current = None;
    }

    fn open_next(&mut self) -> Result<bool, std::io::Error> {
        let Some(source) = self.pending.pop_front() else {
            self.report.state.exhausted.store(true, Ordering::SeqCst);
            return Ok(false);
        };

        match File::open(&source.path) {
            Ok(file) => {
                debug!(file = %source.filename, index = source.index, "Ingesting data file");
                self.observer.file_started(source.index, &source.filename);
                self.current = Some(OpenFile {
                    source,
                    reader: BufReader::new(file),
                    line_no: 0,
                    loaded: 0,
                    skipped: 0,
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(file = %source.filename, "Data file not found");
                self.observer.file_failed(source.index, &source.filename);
                self.report.state.files_done.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                self.observer.file_failed(source.index, &source.filename);
                return Err(e);
            }
        }
        Ok(true)
    }
}

impl Iterator for RecordStream {
    type Item = TrainingRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
                self.stop(None);
                return None;
            }

            let Some(open) = self.current.as_mut() else {
                match self.open_next() {
                    Ok(true) => continue,
                    Ok(false) => {
                        self.finished = true;
                        return None;
                    }
                    Err(e) => {
                        self.stop(Some(e));
                        return None;
                    }
                }
            };

            self.buf.clear();
            match open.reader.read_line(&mut self.buf) {
                Ok(0) => {
                    let done = self.current.take();
                    if let Some(done) = done {
                        self.observer.file_completed(
                            done.source.index,
                            &done.source.filename,
                            done.loaded,
                            done.skipped,
                        );
                        self.report.state.files_done.fetch_add(1, Ordering::SeqCst);
                    }
                }
                Ok(_) => {
                    open.line_no += 1;
                    match parse_line(&self.buf) {
                        ParsedLine::Blank => {}
                        ParsedLine::Record(record) => {
                            open.loaded += 1;
                            self.report.state.rows_loaded.fetch_add(1, Ordering::SeqCst);
                            self.observer.row_loaded(open.source.index);
                            return Some(record);
                        }
                        ParsedLine::Rejected(reason) => {
                            open.skipped += 1;
                            self.report.state.rows_skipped.fetch_add(1, Ordering::SeqCst);
                            warn!(
                                file = %open.source.filename,
                                line = open.line_no,
                                reason = %reason,
                                "Skipping invalid row"
                            );
                            self.observer.row_skipped(
                                open.source.index,
                                &open.source.filename,
                                open.line_no,
                                &reason,
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(file = %open.source.filename, error = %e, "Failed to read data file");
                    self.observer.file_failed(open.source.index, &open.source.filename);
                    self.stop(Some(e));
                    return None;
                }
            }
        }
    }
}

impl FusedIterator for RecordStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl IngestObserver for Recorder {
        fn file_started(&self, index: usize, _filename: &str) {
            self.events.lock().unwrap().push(format!("start:{index}"));
        }

        fn file_failed(&self, index: usize, _filename: &str) {
            self.events.lock().unwrap().push(format!("failed:{index}"));
        }

        fn row_skipped(&self, index: usize, _filename: &str, line: usize, _reason: &RowRejection) {
            self.events.lock().unwrap().push(format!("skip:{index}:{line}"));
        }

        fn file_completed(&self, index: usize, _filename: &str, loaded: u64, skipped: u64) {
            self.events.lock().unwrap().push(format!("done:{index}:{loaded}:{skipped}"));
        }
    }

    fn source(dir: &TempDir, index: usize, name: &str) -> IngestSource {
        IngestSource { index, filename: name.to_string(), path: dir.path().join(name) }
    }

    #[test]
    fn test_streams_files_in_order_and_counts_rows() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("a.jsonl"),
            "{\"instruction\":\"q1\",\"output\":\"a1\"}\n\n{bad json\n",
        )
        .unwrap();
        std::fs::write(temp.path().join("b.jsonl"), "{\"instruction\":\"q2\",\"output\":\"a2\"}")
            .unwrap();

        let recorder = Arc::new(Recorder::default());
        let stream = RecordStream::new(
            vec![source(&temp, 0, "a.jsonl"), source(&temp, 1, "gone.jsonl"), source(&temp, 2, "b.jsonl")],
            recorder.clone(),
        );
        let report = stream.report();

        let records: Vec<_> = stream.collect();
        assert_eq!(records, vec![TrainingRecord::new("q1", "a1"), TrainingRecord::new("q2", "a2")]);
        assert_eq!(
            recorder.events(),
            vec!["start:0", "skip:0:3", "done:0:1:1", "failed:1", "start:2", "done:2:1:0"]
        );
        assert_eq!(report.rows_loaded(), 2);
        assert_eq!(report.rows_skipped(), 1);
        assert_eq!(report.files_done(), 3);
        assert!(report.is_exhausted());
        assert!(report.take_error().is_none());
    }

    #[test]
    fn test_stops_when_cancelled() {
        let temp = TempDir::new().unwrap();
        let rows = "{\"instruction\":\"q\",\"output\":\"a\"}\n".repeat(5);
        std::fs::write(temp.path().join("a.jsonl"), rows).unwrap();

        let token = CancellationToken::new();
        let mut stream = RecordStream::new(vec![source(&temp, 0, "a.jsonl")], Arc::new(Recorder::default()))
            .with_cancellation(token.clone());
        let report = stream.report();

        assert!(stream.next().is_some());
        token.cancel();
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert_eq!(report.rows_loaded(), 1);
        assert!(!report.is_exhausted());
    }

    #[test]
    fn test_invalid_utf8_is_an_io_error() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.jsonl"), [0xff, 0xfe, b'\n']).unwrap();

        let stream = RecordStream::new(vec![source(&temp, 0, "a.jsonl")], Arc::new(Recorder::default()));
        let report = stream.report();
        assert_eq!(stream.count(), 0);
        assert!(report.take_error().is_some());
        assert!(!report.is_exhausted());
    }
}
