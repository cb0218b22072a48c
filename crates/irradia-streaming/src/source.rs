//! Backing store access and the asynchronous disk reader.
//!
//! Baked data files expose per-cell byte ranges at a fixed element size.
//! Reads run on a dedicated worker thread; the frame loop submits read
//! jobs and polls for completion, never blocking on I/O.

use std::fs::File;
use std::io::{Read as _, Seek, SeekFrom};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use hashbrown::{HashMap, HashSet};

/// Byte range of one cell within a backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellLocation {
    /// Offset of the cell's data within the file.
    pub offset: u64,
    /// Number of elements stored for the cell.
    pub element_count: u32,
}

/// Backing store contract for one baked data channel.
///
/// Implementations must be cheap to query on the main thread; `read` runs
/// on the reader worker thread only.
pub trait CellDataSource: Send {
    /// Whether the backing data is reachable at all.
    fn exists(&self) -> bool;
    /// Fixed size in bytes of one stored element.
    fn element_size(&self) -> u32;
    /// Byte range for a cell, or `None` if the cell has no data here.
    fn cell_location(&self, cell_index: u32) -> Option<CellLocation>;
    /// Read `dest.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u64, dest: &mut [u8]) -> std::io::Result<()>;
}

/// File-backed data source with a lazily opened handle.
#[derive(Debug)]
pub struct FileCellSource {
    path: PathBuf,
    element_size: u32,
    locations: HashMap<u32, CellLocation>,
    file: Option<File>,
}

impl FileCellSource {
    #[must_use]
    pub fn new(path: PathBuf, element_size: u32, locations: HashMap<u32, CellLocation>) -> Self {
        Self {
            path,
            element_size,
            locations,
            file: None,
        }
    }
}

impl CellDataSource for FileCellSource {
    fn exists(&self) -> bool {
        self.file.is_some() || self.path.exists()
    }

    fn element_size(&self) -> u32 {
        self.element_size
    }

    fn cell_location(&self, cell_index: u32) -> Option<CellLocation> {
        self.locations.get(&cell_index).copied()
    }

    fn read(&mut self, offset: u64, dest: &mut [u8]) -> std::io::Result<()> {
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => self.file.insert(File::open(&self.path)?),
        };
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(dest)
    }
}

/// In-memory data source, used for CPU-resident baked sets and tests.
#[derive(Debug)]
pub struct MemoryCellSource {
    bytes: Vec<u8>,
    element_size: u32,
    locations: HashMap<u32, CellLocation>,
}

impl MemoryCellSource {
    #[must_use]
    pub fn new(bytes: Vec<u8>, element_size: u32, locations: HashMap<u32, CellLocation>) -> Self {
        Self {
            bytes,
            element_size,
            locations,
        }
    }
}

impl CellDataSource for MemoryCellSource {
    fn exists(&self) -> bool {
        true
    }

    fn element_size(&self) -> u32 {
        self.element_size
    }

    fn cell_location(&self, cell_index: u32) -> Option<CellLocation> {
        self.locations.get(&cell_index).copied()
    }

    fn read(&mut self, offset: u64, dest: &mut [u8]) -> std::io::Result<()> {
        let start = offset as usize;
        let end = start + dest.len();
        if end > self.bytes.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of in-memory source",
            ));
        }
        dest.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// Identifier of a registered data source.
pub type SourceId = u32;

/// Identifier of an in-flight read.
pub type ReadId = u64;

/// One read instruction: file range to destination buffer offset.
#[derive(Debug, Clone, Copy)]
pub struct ReadCommand {
    pub offset: u64,
    pub size: usize,
    pub dest_offset: usize,
}

/// Completion state of a read as seen by the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    InFlight,
    Complete,
    Failed,
}

enum WorkerMessage {
    Register(SourceId, Box<dyn CellDataSource>),
    Unregister(SourceId),
    Submit(ReadJob),
    Shutdown,
}

struct ReadJob {
    id: ReadId,
    source: SourceId,
    commands: Vec<ReadCommand>,
    buffer_len: usize,
}

struct ReadResult {
    id: ReadId,
    buffer: Vec<u8>,
    ok: bool,
}

/// Asynchronous reader running a dedicated worker thread.
pub struct DiskReader {
    request_tx: Sender<WorkerMessage>,
    result_rx: Receiver<ReadResult>,
    thread: Option<JoinHandle<()>>,
    next_source_id: SourceId,
    next_read_id: ReadId,
    completed: HashMap<ReadId, (Vec<u8>, bool)>,
    canceled: HashSet<ReadId>,
    in_flight: usize,
}

impl DiskReader {
    /// Spawn the reader worker thread.
    #[must_use]
    pub fn new() -> Self {
        let (request_tx, request_rx) = channel::bounded::<WorkerMessage>(64);
        let (result_tx, result_rx) = channel::bounded::<ReadResult>(64);

        let thread = thread::Builder::new()
            .name("cell-streaming-io".to_string())
            .spawn(move || Self::worker_loop(&request_rx, &result_tx))
            .expect("failed to spawn streaming reader thread");

        Self {
            request_tx,
            result_rx,
            thread: Some(thread),
            next_source_id: 0,
            next_read_id: 0,
            completed: HashMap::new(),
            canceled: HashSet::new(),
            in_flight: 0,
        }
    }

    fn worker_loop(request_rx: &Receiver<WorkerMessage>, result_tx: &Sender<ReadResult>) {
        let mut sources: HashMap<SourceId, Box<dyn CellDataSource>> = HashMap::new();
        loop {
            match request_rx.recv() {
                Ok(WorkerMessage::Register(id, source)) => {
                    sources.insert(id, source);
                }
                Ok(WorkerMessage::Unregister(id)) => {
                    sources.remove(&id);
                }
                Ok(WorkerMessage::Submit(job)) => {
                    let mut buffer = vec![0u8; job.buffer_len];
                    let mut ok = true;
                    if let Some(source) = sources.get_mut(&job.source) {
                        for command in &job.commands {
                            let dest =
                                &mut buffer[command.dest_offset..command.dest_offset + command.size];
                            if let Err(err) = source.read(command.offset, dest) {
                                tracing::warn!(read = job.id, %err, "streaming read failed");
                                ok = false;
                                break;
                            }
                        }
                    } else {
                        ok = false;
                    }
                    if result_tx
                        .send(ReadResult {
                            id: job.id,
                            buffer,
                            ok,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(WorkerMessage::Shutdown) | Err(_) => return,
            }
        }
    }

    /// Register a data source with the worker and get its handle.
    pub fn register_source(&mut self, source: Box<dyn CellDataSource>) -> SourceId {
        let id = self.next_source_id;
        self.next_source_id += 1;
        let _ = self.request_tx.send(WorkerMessage::Register(id, source));
        id
    }

    /// Drop a previously registered source.
    pub fn unregister_source(&mut self, id: SourceId) {
        let _ = self.request_tx.send(WorkerMessage::Unregister(id));
    }

    /// Submit a read job against a source. `buffer_len` sizes the result
    /// buffer; every command's destination range must fit inside it.
    pub fn submit(
        &mut self,
        source: SourceId,
        commands: Vec<ReadCommand>,
        buffer_len: usize,
    ) -> ReadId {
        debug_assert!(commands
            .iter()
            .all(|c| c.dest_offset + c.size <= buffer_len));
        let id = self.next_read_id;
        self.next_read_id += 1;
        self.in_flight += 1;
        let _ = self.request_tx.send(WorkerMessage::Submit(ReadJob {
            id,
            source,
            commands,
            buffer_len,
        }));
        id
    }

    /// Drain finished reads from the worker. Call once per frame.
    pub fn poll(&mut self) {
        while let Ok(result) = self.result_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if self.canceled.remove(&result.id) {
                continue;
            }
            self.completed.insert(result.id, (result.buffer, result.ok));
        }
    }

    /// Completion status of a read.
    #[must_use]
    pub fn status(&self, id: ReadId) -> ReadStatus {
        match self.completed.get(&id) {
            Some((_, true)) => ReadStatus::Complete,
            Some((_, false)) => ReadStatus::Failed,
            None => ReadStatus::InFlight,
        }
    }

    /// Take the buffer of a completed read. Returns `None` while in flight.
    pub fn take_buffer(&mut self, id: ReadId) -> Option<(Vec<u8>, bool)> {
        self.completed.remove(&id)
    }

    /// Forget a read; if it completes later the result is dropped.
    pub fn cancel(&mut self, id: ReadId) {
        if self.completed.remove(&id).is_none() {
            self.canceled.insert(id);
        }
    }

    /// Reads submitted but not yet collected.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
    }
}

impl Default for DiskReader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DiskReader {
    fn drop(&mut self) {
        let _ = self.request_tx.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn wait_complete(reader: &mut DiskReader, id: ReadId) -> (Vec<u8>, bool) {
        for _ in 0..200 {
            reader.poll();
            if reader.status(id) != ReadStatus::InFlight {
                return reader.take_buffer(id).unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        panic!("read {id} did not complete");
    }

    #[test]
    fn memory_source_round_trip() {
        let mut locations = HashMap::new();
        locations.insert(0, CellLocation { offset: 2, element_count: 4 });
        let source = MemoryCellSource::new(vec![1, 2, 3, 4, 5, 6, 7, 8], 1, locations);

        let mut reader = DiskReader::new();
        let id = reader.register_source(Box::new(source));
        let read = reader.submit(
            id,
            vec![ReadCommand { offset: 2, size: 4, dest_offset: 1 }],
            6,
        );

        let (buffer, ok) = wait_complete(&mut reader, read);
        assert!(ok);
        assert_eq!(buffer, vec![0, 3, 4, 5, 6, 0]);
    }

    #[test]
    fn file_source_reads_ranges() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9u8, 8, 7, 6, 5, 4, 3, 2]).unwrap();
        let path = file.path().to_path_buf();

        let source = FileCellSource::new(path, 2, HashMap::new());
        assert!(source.exists());

        let mut reader = DiskReader::new();
        let id = reader.register_source(Box::new(source));
        let read = reader.submit(
            id,
            vec![
                ReadCommand { offset: 0, size: 2, dest_offset: 0 },
                ReadCommand { offset: 6, size: 2, dest_offset: 2 },
            ],
            4,
        );

        let (buffer, ok) = wait_complete(&mut reader, read);
        assert!(ok);
        assert_eq!(buffer, vec![9, 8, 3, 2]);
    }

    #[test]
    fn out_of_range_read_fails() {
        let source = MemoryCellSource::new(vec![0; 4], 1, HashMap::new());
        let mut reader = DiskReader::new();
        let id = reader.register_source(Box::new(source));
        let read = reader.submit(
            id,
            vec![ReadCommand { offset: 2, size: 8, dest_offset: 0 }],
            8,
        );

        let (_, ok) = wait_complete(&mut reader, read);
        assert!(!ok);
    }

    #[test]
    fn canceled_reads_are_dropped() {
        let source = MemoryCellSource::new(vec![1; 16], 1, HashMap::new());
        let mut reader = DiskReader::new();
        let id = reader.register_source(Box::new(source));
        let read = reader.submit(
            id,
            vec![ReadCommand { offset: 0, size: 16, dest_offset: 0 }],
            16,
        );
        reader.cancel(read);

        // The result never surfaces once canceled.
        for _ in 0..50 {
            reader.poll();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(reader.status(read), ReadStatus::InFlight);
        assert!(reader.take_buffer(read).is_none());
    }
}
