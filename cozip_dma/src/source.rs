use std::fs::File;
use std::io;

/// Positioned reads against a compressed stream's backing storage.
///
/// One call models one overlapped read: it may return fewer bytes than asked
/// for only at end of data. Handles that need aligned offsets and lengths
/// reject unaligned requests with [`io::ErrorKind::InvalidInput`]; the
/// streaming reader then switches that file to aligned reads.
pub trait CompressedSource: Send + Sync + 'static {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl CompressedSource for File {
    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;

        let mut filled = 0;
        while filled < buf.len() {
            match FileExt::read_at(self, &mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;

        let mut filled = 0;
        while filled < buf.len() {
            match self.seek_read(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }
}

impl CompressedSource for Vec<u8> {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?;
        let available = self.get(start..).unwrap_or(&[]);
        let read = available.len().min(buf.len());
        buf[..read].copy_from_slice(&available[..read]);
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_reads_until_end() {
        let data: Vec<u8> = (0..10u8).collect();
        let mut buf = [0u8; 8];
        assert_eq!(data.read_at(6, &mut buf).expect("read should succeed"), 4);
        assert_eq!(&buf[..4], &[6, 7, 8, 9]);
        assert_eq!(data.read_at(20, &mut buf).expect("read past end"), 0);
    }

    #[test]
    fn file_source_reads_at_offset() {
        let path = std::env::temp_dir().join(format!("cozip_dma_source_{}", std::process::id()));
        std::fs::write(&path, b"0123456789").expect("write temp file");
        let file = File::open(&path).expect("open temp file");

        let mut buf = [0u8; 4];
        let read = CompressedSource::read_at(&file, 3, &mut buf).expect("read should succeed");
        assert_eq!(read, 4);
        assert_eq!(&buf, b"3456");

        let _ = std::fs::remove_file(&path);
    }
}
