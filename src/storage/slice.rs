//! Bounded read window over a seekable stream.

use std::io::{self, Read, Seek, SeekFrom};

/// A read view exposing only `[begin, begin + chunk_size)` of a stream.
///
/// The window end is computed from the stream's current position on every
/// read, so the slice stays correct even if the caller seeks the underlying
/// stream between reads.
pub struct StreamSlice<'a, S: Read + Seek + ?Sized> {
    stream: &'a mut S,
    begin: u64,
    chunk_size: u64,
}

impl<'a, S: Read + Seek + ?Sized> StreamSlice<'a, S> {
    /// Creates the slice and positions `stream` at `begin`.
    pub fn new(stream: &'a mut S, begin: u64, chunk_size: u64) -> io::Result<Self> {
        stream.seek(SeekFrom::Start(begin))?;
        Ok(Self {
            stream,
            begin,
            chunk_size,
        })
    }

    /// Exclusive end of the window.
    pub fn end(&self) -> u64 {
        self.begin + self.chunk_size
    }
}

impl<S: Read + Seek + ?Sized> Read for StreamSlice<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let current = self.stream.stream_position()?;
        let remaining = self.end().saturating_sub(current);
        let n = remaining.min(buf.len() as u64) as usize;
        if n == 0 {
            return Ok(0);
        }
        self.stream.read(&mut buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn data(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    #[test]
    fn test_read_to_end_stops_at_window() {
        let mut stream = data(100);
        let mut slice = StreamSlice::new(&mut stream, 10, 20).unwrap();
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert_eq!(out, (10..30).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_window_past_end_of_stream() {
        let mut stream = data(25);
        let mut slice = StreamSlice::new(&mut stream, 20, 20).unwrap();
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_small_reads_never_cross_window() {
        for begin in [0u64, 1, 7, 63] {
            for chunk in [1u64, 3, 16, 40] {
                let mut stream = data(128);
                let mut slice = StreamSlice::new(&mut stream, begin, chunk).unwrap();
                let mut total = 0u64;
                for request in [1usize, 2, 5, 100, 3, 0, 7].iter().cycle().take(30) {
                    let mut buf = vec![0u8; *request];
                    let n = slice.read(&mut buf).unwrap();
                    for (i, byte) in buf[..n].iter().enumerate() {
                        let offset = begin + total + i as u64;
                        assert!(offset < begin + chunk);
                        assert_eq!(*byte, (offset % 251) as u8);
                    }
                    total += n as u64;
                }
                assert_eq!(total, chunk);
            }
        }
    }

    #[test]
    fn test_window_follows_current_position() {
        let mut stream = data(64);
        {
            let mut slice = StreamSlice::new(&mut stream, 0, 8).unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(slice.read(&mut buf).unwrap(), 4);
        }
        // A later slice over the same stream reseeks to its own window.
        let mut slice = StreamSlice::new(&mut stream, 32, 8).unwrap();
        let mut out = Vec::new();
        slice.read_to_end(&mut out).unwrap();
        assert_eq!(out, (32..40).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_length_window() {
        let mut stream = data(10);
        let mut slice = StreamSlice::new(&mut stream, 4, 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(slice.read(&mut buf).unwrap(), 0);
    }
}
