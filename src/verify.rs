use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use tracing::{debug, info};

use crate::error::DevUpdateError;
use crate::progress::{ProgressSink, percent_of};

const VERIFY_BLOCK_SIZE: usize = 8192;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Verified,
    Mismatch { actual: String },
    Cancelled,
}

/// What one file check found and how many bytes were hashed to find it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileCheck {
    pub verification: Verification,
    pub hashed: u64,
}

/// Streaming md5 check of staged image files against their `.md5` companions.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    pub fn verify(
        &self,
        expected: &str,
        path: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<FileCheck, DevUpdateError> {
        let read_error = |err: std::io::Error| DevUpdateError::Filesystem(format!("{}: {err}", path.display()));
        let mut file = File::open(path).map_err(read_error)?;
        let total = file.metadata().map_err(read_error)?.len();

        let mut hasher = Md5::new();
        let mut buffer = [0u8; VERIFY_BLOCK_SIZE];
        let mut done = 0u64;
        loop {
            if sink.is_cancellation_requested() {
                info!(path = %path.display(), "verification cancelled");
                return Ok(FileCheck {
                    verification: Verification::Cancelled,
                    hashed: done,
                });
            }
            let read = file.read(&mut buffer).map_err(read_error)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            done += read as u64;
            sink.report_progress(percent_of(done, total), "");
        }

        let actual = hex::encode(hasher.finalize());
        let verification = if actual == expected.trim().to_lowercase() {
            debug!(path = %path.display(), "checksum verified");
            Verification::Verified
        } else {
            Verification::Mismatch { actual }
        };
        Ok(FileCheck {
            verification,
            hashed: done,
        })
    }
}

/// The checksum in a `.md5` file: its first whitespace separated token.
pub fn read_checksum_file(path: &Path) -> Result<String, DevUpdateError> {
    let content = fs::read_to_string(path)
        .map_err(|err| DevUpdateError::Filesystem(format!("{}: {err}", path.display())))?;
    content
        .split_whitespace()
        .next()
        .map(str::to_lowercase)
        .ok_or_else(|| DevUpdateError::Filesystem(format!("{} is empty", path.display())))
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::progress::NullSink;

    struct CancelNow(Cell<u32>);

    impl ProgressSink for CancelNow {
        fn report_progress(&self, _percent: u8, _detail: &str) {}

        fn is_cancellation_requested(&self) -> bool {
            self.0.set(self.0.get() + 1);
            true
        }
    }

    #[test]
    fn verifies_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("SYSTEM");
        fs::write(&image, b"hello world").unwrap();
        let md5 = dir.path().join("SYSTEM.md5");
        fs::write(&md5, "5EB63BBBE01EEED093CB22BB8F5ACDC3  target/SYSTEM\n").unwrap();

        let expected = read_checksum_file(&md5).unwrap();
        let result = IntegrityVerifier::new().verify(&expected, &image, &NullSink).unwrap();
        assert_eq!(result.verification, Verification::Verified);
        assert_eq!(result.hashed, 11);
    }

    #[test]
    fn reports_mismatch_and_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("KERNEL");
        fs::write(&image, b"kernel").unwrap();

        let verifier = IntegrityVerifier::new();
        let result = verifier.verify("00000000000000000000000000000000", &image, &NullSink).unwrap();
        assert!(matches!(result.verification, Verification::Mismatch { .. }));
        assert_eq!(result.hashed, 6);

        let sink = CancelNow(Cell::new(0));
        let result = verifier.verify("00", &image, &sink).unwrap();
        assert_eq!(result.verification, Verification::Cancelled);
        assert_eq!(result.hashed, 0);
        assert_eq!(sink.0.get(), 1);
    }
}
