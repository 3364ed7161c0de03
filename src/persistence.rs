//! Capture persistence.
//!
//! A finished spectrum is written as a flat array of little-endian `f32`
//! values with no header, one file per capture:
//!
//! ```text
//! <dir>/fft_values_<address>_<node time>.f32
//! ```

use log::info;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name prefix for FFT spectra.
pub const FFT_CAPTURE_PURPOSE: &str = "fft_values";

/// Directory used when none is configured.
pub fn default_capture_dir() -> PathBuf {
    std::env::temp_dir().join("lora-gateway").join("captures")
}

/// Encode samples as raw little-endian `f32`.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}

/// Decode a raw little-endian `f32` file body.
pub fn decode_samples(bytes: &[u8]) -> io::Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{} bytes is not a whole number of f32 samples", bytes.len()),
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Path of the capture file for a node and capture time.
pub fn capture_path(dir: &Path, purpose: &str, address: u32, time: u32) -> PathBuf {
    dir.join(format!("{}_{:08X}_{}.f32", purpose, address, time))
}

/// Write samples to `path`, creating the parent directory if needed.
pub fn write_samples(path: &Path, samples: &[f32]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = encode_samples(samples);
    fs::write(path, &bytes)?;

    // Verify write by reading back
    let read_back = fs::read(path)?;
    if read_back != bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Capture verification failed: wrote {} bytes, read {} bytes",
                bytes.len(),
                read_back.len()
            ),
        ));
    }

    info!("Capture of {} samples saved to {:?}", samples.len(), path);
    Ok(())
}

/// Read a capture file back.
pub fn read_samples(path: &Path) -> io::Result<Vec<f32>> {
    decode_samples(&fs::read(path)?)
}

/// Where finished captures go.
#[derive(Debug, Clone)]
pub struct CaptureStore {
    dir: PathBuf,
}

impl CaptureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Flush one FFT capture. Returns the written path.
    pub fn store_fft(&self, address: u32, time: u32, bins: &[f32]) -> io::Result<PathBuf> {
        let path = capture_path(&self.dir, FFT_CAPTURE_PURPOSE, address, time);
        write_samples(&path, bins)?;
        Ok(path)
    }
}

impl Default for CaptureStore {
    fn default() -> Self {
        Self::new(default_capture_dir())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test directories even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    pub(crate) fn unique_capture_dir() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir().join(format!("lora-gateway-test-{}-{}", pid, id))
    }

    #[test]
    fn test_file_is_raw_little_endian() {
        let dir = unique_capture_dir();
        let store = CaptureStore::new(&dir);
        let path = store.store_fft(0x0D47_3533, 42, &[1.0, -2.5]).unwrap();

        assert_eq!(
            path.file_name().and_then(|n| n.to_str()),
            Some("fft_values_0D473533_42.f32")
        );
        let raw = fs::read(&path).unwrap();
        assert_eq!(raw.len(), 8);
        assert_eq!(&raw[0..4], &1.0f32.to_le_bytes());
        assert_eq!(read_samples(&path).unwrap(), vec![1.0, -2.5]);

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_decode_rejects_partial_sample() {
        assert!(decode_samples(&[0, 0, 0]).is_err());
        assert_eq!(decode_samples(&[]).unwrap(), Vec::<f32>::new());
    }
}
