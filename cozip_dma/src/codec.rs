use std::fmt;
use std::io::{Read, Write};
use std::num::NonZeroU64;

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::CozipDmaError;

/// A codec that turns one input slice into one self-contained stream.
///
/// Implementations back both the software fragment backends and the emulated
/// transfer engine's LZ unit.
pub trait FragmentCodec: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CozipDmaError>;

    /// Decodes `src` into `dst` and returns the number of bytes produced.
    /// A stream that would produce more than `dst.len()` bytes is an error.
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CozipDmaError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ZlibCodec {
    level: u32,
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl ZlibCodec {
    pub fn new(level: u32) -> Self {
        Self {
            level: level.clamp(0, 9),
        }
    }

    pub fn level(&self) -> u32 {
        self.level
    }
}

impl FragmentCodec for ZlibCodec {
    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CozipDmaError> {
        let mut encoder = ZlibEncoder::new(
            Vec::with_capacity(src.len() / 2 + 64),
            Compression::new(self.level),
        );
        encoder.write_all(src)?;
        Ok(encoder.finish()?)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CozipDmaError> {
        inflate_zlib_into(src, dst)
    }
}

/// Slower zlib-compatible encoder with a better ratio. Streams decode with
/// plain zlib.
#[derive(Debug, Clone, Copy)]
pub struct ZopfliCodec {
    pub iterations: u64,
    pub max_block_splits: u16,
}

impl Default for ZopfliCodec {
    fn default() -> Self {
        Self {
            iterations: 5,
            max_block_splits: 15,
        }
    }
}

impl FragmentCodec for ZopfliCodec {
    fn name(&self) -> &'static str {
        "zopfli"
    }

    fn compress(&self, src: &[u8]) -> Result<Vec<u8>, CozipDmaError> {
        let iteration_count = NonZeroU64::new(self.iterations.max(1))
            .ok_or(CozipDmaError::InvalidOptions("zopfli iterations must be non-zero"))?;
        let options = zopfli::Options {
            iteration_count,
            maximum_block_splits: self.max_block_splits,
            ..zopfli::Options::default()
        };

        let mut out = Vec::with_capacity(src.len() / 2 + 64);
        zopfli::compress(options, zopfli::Format::Zlib, src, &mut out)?;
        Ok(out)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize, CozipDmaError> {
        inflate_zlib_into(src, dst)
    }
}

fn inflate_zlib_into(src: &[u8], dst: &mut [u8]) -> Result<usize, CozipDmaError> {
    let mut decoder = ZlibDecoder::new(src);
    let mut written = 0;
    while written < dst.len() {
        let read = decoder
            .read(&mut dst[written..])
            .map_err(|_| CozipDmaError::DataChecksum("corrupt zlib stream"))?;
        if read == 0 {
            return Ok(written);
        }
        written += read;
    }

    let mut probe = [0u8; 1];
    let extra = decoder
        .read(&mut probe)
        .map_err(|_| CozipDmaError::DataChecksum("corrupt zlib stream"))?;
    if extra != 0 {
        return Err(CozipDmaError::DataChecksum(
            "zlib stream larger than destination",
        ));
    }
    Ok(written)
}
