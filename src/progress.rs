use std::cell::Cell;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::time::Instant;

use crate::pipeline::Stage;

/// Bytes moved per read in every streaming stage.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// What the host provides to watch a long operation.
///
/// `report_progress` is called after every block with a percentage and a
/// short detail such as the current transfer rate. Cancellation is polled
/// before every block; nothing interrupts a read already in progress.
pub trait ProgressSink {
    fn begin(&self, _stage: Stage, _label: &str) {}

    fn report_progress(&self, percent: u8, detail: &str);

    fn is_cancellation_requested(&self) -> bool;

    fn finish(&self) {}
}

/// Sink that ignores progress and never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report_progress(&self, _percent: u8, _detail: &str) {}

    fn is_cancellation_requested(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Complete(u64),
    Cancelled(u64),
}

impl Transfer {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Transfer::Cancelled(_))
    }
}

#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Stream `reader` into `writer` in [`BLOCK_SIZE`] blocks.
///
/// Progress is `written / total` unless `consumed` is given, in which case
/// it tracks that counter instead (the compressed side of a decoder). The
/// detail string is the rate over the whole transfer so far.
pub fn copy_with_progress<R, W>(
    reader: &mut R,
    writer: &mut W,
    total: Option<u64>,
    sink: &dyn ProgressSink,
    consumed: Option<&Cell<u64>>,
) -> Result<Transfer, CopyError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buffer = vec![0u8; BLOCK_SIZE];
    let mut written = 0u64;
    let started = Instant::now();

    loop {
        if sink.is_cancellation_requested() {
            return Ok(Transfer::Cancelled(written));
        }
        let read = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(CopyError::Read(err)),
        };
        writer.write_all(&buffer[..read]).map_err(CopyError::Write)?;
        written += read as u64;

        let done = consumed.map(Cell::get).unwrap_or(written);
        let percent = total.map(|total| percent_of(done, total)).unwrap_or(0);
        let elapsed = started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            (done as f64 / elapsed) as u64
        } else {
            0
        };
        sink.report_progress(percent, &format!("{}/s", size_fmt(rate)));
    }
    writer.flush().map_err(CopyError::Write)?;
    Ok(Transfer::Complete(written))
}

pub fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

/// Passes reads through while counting bytes into a shared cell.
pub struct CountingReader<R> {
    inner: R,
    count: Rc<Cell<u64>>,
}

impl<R> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            count: Rc::new(Cell::new(0)),
        }
    }

    pub fn counter(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.count)
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.count.set(self.count.get() + read as u64);
        Ok(read)
    }
}

/// Human readable byte count: `512 B`, `12.3 KB`, `4.5 MB`.
pub fn size_fmt(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    let value = bytes as f64;
    if value < KB {
        format!("{bytes} B")
    } else if value < MB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{:.1} MB", value / MB)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;

    struct CancelAfter {
        reports: RefCell<Vec<u8>>,
        limit: usize,
    }

    impl ProgressSink for CancelAfter {
        fn report_progress(&self, percent: u8, _detail: &str) {
            self.reports.borrow_mut().push(percent);
        }

        fn is_cancellation_requested(&self) -> bool {
            self.reports.borrow().len() >= self.limit
        }
    }

    #[test]
    fn reports_every_block_and_completes() {
        let data = vec![7u8; BLOCK_SIZE * 2 + 10];
        let sink = CancelAfter {
            reports: RefCell::new(Vec::new()),
            limit: usize::MAX,
        };
        let mut out = Vec::new();
        let result = copy_with_progress(
            &mut data.as_slice(),
            &mut out,
            Some(data.len() as u64),
            &sink,
            None,
        )
        .unwrap();
        assert_eq!(result, Transfer::Complete(data.len() as u64));
        assert_eq!(out, data);
        assert_eq!(sink.reports.borrow().last(), Some(&100));
    }

    #[test]
    fn stops_before_next_block_when_cancelled() {
        let data = vec![1u8; BLOCK_SIZE * 4];
        let sink = CancelAfter {
            reports: RefCell::new(Vec::new()),
            limit: 2,
        };
        let mut out = Vec::new();
        let result =
            copy_with_progress(&mut data.as_slice(), &mut out, None, &sink, None).unwrap();
        assert_eq!(result, Transfer::Cancelled(2 * BLOCK_SIZE as u64));
    }

    #[test]
    fn formats_sizes() {
        assert_eq!(size_fmt(512), "512 B");
        assert_eq!(size_fmt(2048), "2.0 KB");
        assert_eq!(size_fmt(3 * 1024 * 1024 + 512 * 1024), "3.5 MB");
    }
}
