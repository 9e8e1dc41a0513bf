//! Android sparse image decoding and chunk merging
//!
//! A sparse image is a [`SparseHeader`] followed by `total_chunks` chunks, each a
//! [`ChunkHeader`] followed by its payload. Chunks are laid out back to back and cover the
//! output image in block order.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use deku::prelude::*;
use tracing::{debug, trace};

use crate::error::PartimgError;

pub const SPARSE_HEADER_MAGIC: u32 = 0xED26FF3A;

/// On-disk size of [`SparseHeader`]
pub const SPARSE_HEADER_SIZE: usize = 28;

/// On-disk size of [`ChunkHeader`]
pub const CHUNK_HEADER_SIZE: usize = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xCAC1;
pub const CHUNK_TYPE_FILL: u16 = 0xCAC2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xCAC3;
pub const CHUNK_TYPE_CRC32: u16 = 0xCAC4;

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct SparseHeader {
    /// Must be set to 0xED26FF3A
    pub magic: u32,
    /// Must be set to 1
    pub major_version: u16,
    pub minor_version: u16,
    /// Size of this header, 28 in every known writer
    pub file_hdr_sz: u16,
    /// Size of each chunk header, 12 in every known writer
    pub chunk_hdr_sz: u16,
    /// Block size in bytes, multiple of 4
    pub blk_sz: u32,
    /// Block count of the output image
    pub total_blks: u32,
    pub total_chunks: u32,
    /// crc32 of the original data, 0 when unused
    pub image_checksum: u32,
}

impl SparseHeader {
    pub fn new(blk_sz: u32, total_blks: u32, total_chunks: u32) -> Self {
        Self {
            magic: SPARSE_HEADER_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: SPARSE_HEADER_SIZE as u16,
            chunk_hdr_sz: CHUNK_HEADER_SIZE as u16,
            blk_sz,
            total_blks,
            total_chunks,
            image_checksum: 0,
        }
    }

    /// Read the header, skipping any bytes past the fields we know
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, PartimgError> {
        let mut buf = [0_u8; SPARSE_HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let (_, header) = Self::from_bytes((&buf, 0))?;
        header.validate()?;
        let extra = u64::from(header.file_hdr_sz) - SPARSE_HEADER_SIZE as u64;
        io::copy(&mut reader.take(extra), &mut io::sink())?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), PartimgError> {
        if self.magic != SPARSE_HEADER_MAGIC {
            return Err(PartimgError::Format(format!("bad sparse magic {:#x}", self.magic)));
        }
        if self.major_version != 1 {
            return Err(PartimgError::Data(format!(
                "unsupported sparse version {}.{}",
                self.major_version, self.minor_version
            )));
        }
        if usize::from(self.file_hdr_sz) < SPARSE_HEADER_SIZE
            || usize::from(self.chunk_hdr_sz) < CHUNK_HEADER_SIZE
        {
            return Err(PartimgError::Data("sparse header sizes too small".to_string()));
        }
        if self.blk_sz == 0 || self.blk_sz % 4 != 0 {
            return Err(PartimgError::Data(format!("invalid sparse block size {}", self.blk_sz)));
        }
        Ok(())
    }

    /// Byte length of the decoded image
    pub fn image_len(&self) -> u64 {
        u64::from(self.total_blks) * u64::from(self.blk_sz)
    }
}

#[derive(Debug, Copy, Clone, DekuRead, DekuWrite, PartialEq, Eq)]
#[deku(endian = "little")]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved1: u16,
    /// Size in blocks of the output this chunk covers
    pub chunk_sz: u32,
    /// Size in bytes of this chunk in the sparse file, header included
    pub total_sz: u32,
}

impl ChunkHeader {
    fn from_reader<R: Read>(mut reader: R, header: &SparseHeader) -> Result<Self, PartimgError> {
        let mut buf = [0_u8; CHUNK_HEADER_SIZE];
        reader.read_exact(&mut buf)?;
        let (_, chunk) = Self::from_bytes((&buf, 0))?;
        let extra = u64::from(header.chunk_hdr_sz) - CHUNK_HEADER_SIZE as u64;
        io::copy(&mut reader.take(extra), &mut io::sink())?;
        Ok(chunk)
    }

    /// Bytes following the header
    fn payload_len(&self, header: &SparseHeader) -> Result<u64, PartimgError> {
        u64::from(self.total_sz).checked_sub(u64::from(header.chunk_hdr_sz)).ok_or_else(|| {
            PartimgError::Data(format!("chunk total size {} below header size", self.total_sz))
        })
    }

    /// Bytes of output image covered
    fn output_len(&self, header: &SparseHeader) -> u64 {
        u64::from(self.chunk_sz) * u64::from(header.blk_sz)
    }
}

/// Decode a sparse image into `writer`, returning the decoded image length
///
/// `DONT_CARE` regions are skipped by seeking, so a trailing one leaves `writer` shorter than
/// the returned length. [`unsparse_file`] extends the output to account for it.
pub fn unsparse<R: Read, W: Write + Seek>(mut reader: R, writer: &mut W) -> Result<u64, PartimgError> {
    let header = SparseHeader::from_reader(&mut reader)?;
    debug!(
        "sparse: blk_sz {}, total_blks {}, total_chunks {}",
        header.blk_sz, header.total_blks, header.total_chunks
    );

    let mut block = 0_u64;
    for index in 0..header.total_chunks {
        let chunk = ChunkHeader::from_reader(&mut reader, &header)?;
        trace!("chunk {index}: {:x?}", chunk);
        let payload_len = chunk.payload_len(&header)?;
        let output_len = chunk.output_len(&header);
        writer.seek(SeekFrom::Start(block * u64::from(header.blk_sz)))?;
        match chunk.chunk_type {
            CHUNK_TYPE_RAW => {
                if payload_len != output_len {
                    return Err(PartimgError::Data(format!(
                        "raw chunk {index} carries {payload_len} bytes for {output_len}"
                    )));
                }
                let copied = io::copy(&mut (&mut reader).take(payload_len), writer)?;
                if copied != payload_len {
                    return Err(PartimgError::Data(format!("raw chunk {index} is truncated")));
                }
            }
            CHUNK_TYPE_FILL => {
                let fill = read_fill(&mut reader, payload_len, index)?;
                write_fill(writer, fill, header.blk_sz, chunk.chunk_sz)?;
            }
            CHUNK_TYPE_DONT_CARE => {}
            CHUNK_TYPE_CRC32 => {
                io::copy(&mut (&mut reader).take(payload_len), &mut io::sink())?;
            }
            other => {
                return Err(PartimgError::Data(format!(
                    "unknown chunk type {other:#06x} at chunk {index}"
                )))
            }
        }
        block += u64::from(chunk.chunk_sz);
    }

    if block != u64::from(header.total_blks) {
        return Err(PartimgError::Data(format!(
            "chunks cover {block} blocks, header declares {}",
            header.total_blks
        )));
    }
    Ok(header.image_len())
}

/// Decode the sparse image at `input` into a new raw image at `output`
pub fn unsparse_file(input: &Path, output: &Path) -> Result<(), PartimgError> {
    let reader = BufReader::new(File::open(input)?);
    let mut writer = BufWriter::new(File::create(output)?);
    let len = unsparse(reader, &mut writer)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.set_len(len)?;
    Ok(())
}

fn read_fill<R: Read>(reader: &mut R, payload_len: u64, index: u32) -> Result<[u8; 4], PartimgError> {
    if payload_len != 4 {
        return Err(PartimgError::Data(format!("fill chunk {index} carries {payload_len} bytes")));
    }
    let mut fill = [0_u8; 4];
    reader.read_exact(&mut fill)?;
    Ok(fill)
}

fn write_fill<W: Write>(writer: &mut W, fill: [u8; 4], blk_sz: u32, blocks: u32) -> io::Result<()> {
    let block: Vec<u8> = fill.iter().copied().cycle().take(blk_sz as usize).collect();
    for _ in 0..blocks {
        writer.write_all(&block)?;
    }
    Ok(())
}

/// Reconstruct the first `len` bytes of the decoded image without decoding the rest
///
/// Used to look for a filesystem superblock inside a sparse container.
pub fn peek<R: Read>(mut reader: R, len: usize) -> Result<Vec<u8>, PartimgError> {
    let header = SparseHeader::from_reader(&mut reader)?;
    let mut out = Vec::with_capacity(len);
    for index in 0..header.total_chunks {
        if out.len() >= len {
            break;
        }
        let chunk = ChunkHeader::from_reader(&mut reader, &header)?;
        let payload_len = chunk.payload_len(&header)?;
        let want = chunk.output_len(&header).min((len - out.len()) as u64) as usize;
        match chunk.chunk_type {
            CHUNK_TYPE_RAW => {
                let start = out.len();
                out.resize(start + want, 0);
                reader.read_exact(&mut out[start..])?;
                io::copy(
                    &mut (&mut reader).take(payload_len.saturating_sub(want as u64)),
                    &mut io::sink(),
                )?;
            }
            CHUNK_TYPE_FILL => {
                let fill = read_fill(&mut reader, payload_len, index)?;
                out.extend(fill.iter().copied().cycle().take(want));
            }
            CHUNK_TYPE_DONT_CARE => out.resize(out.len() + want, 0),
            CHUNK_TYPE_CRC32 => {
                io::copy(&mut (&mut reader).take(payload_len), &mut io::sink())?;
            }
            other => {
                return Err(PartimgError::Data(format!(
                    "unknown chunk type {other:#06x} at chunk {index}"
                )))
            }
        }
    }
    Ok(out)
}

/// Data-carrying region of one chunk file, positioned in the merged image
#[derive(Debug, Clone, Copy)]
struct Extent {
    start_block: u64,
    blocks: u32,
    source: ExtentSource,
}

#[derive(Debug, Clone, Copy)]
enum ExtentSource {
    Raw { file: usize, offset: u64 },
    Fill([u8; 4]),
}

/// Stitch sparse chunk files into one sparse image at `output`
///
/// `chunks` must already be in merge order. Every chunk file describes the whole image and
/// covers the parts owned by other chunk files with `DONT_CARE`, so data regions are placed at
/// their absolute block position. Overlapping data regions are rejected.
pub fn merge_chunks(chunks: &[PathBuf], output: &Path) -> Result<(), PartimgError> {
    let mut blk_sz = None;
    let mut total_blks = 0_u64;
    let mut extents = Vec::new();

    for (file, path) in chunks.iter().enumerate() {
        let mut reader = BufReader::new(File::open(path)?);
        let header = SparseHeader::from_reader(&mut reader)?;
        match blk_sz {
            None => blk_sz = Some(header.blk_sz),
            Some(sz) if sz != header.blk_sz => {
                return Err(PartimgError::Data(format!(
                    "{} has block size {}, expected {sz}",
                    path.display(),
                    header.blk_sz
                )))
            }
            Some(_) => {}
        }

        let mut offset = u64::from(header.file_hdr_sz);
        let mut block = 0_u64;
        for index in 0..header.total_chunks {
            let chunk = ChunkHeader::from_reader(&mut reader, &header)?;
            let payload_len = chunk.payload_len(&header)?;
            offset += u64::from(header.chunk_hdr_sz);
            match chunk.chunk_type {
                CHUNK_TYPE_RAW => {
                    extents.push(Extent {
                        start_block: block,
                        blocks: chunk.chunk_sz,
                        source: ExtentSource::Raw { file, offset },
                    });
                    reader.seek_relative(payload_len as i64)?;
                }
                CHUNK_TYPE_FILL => {
                    let fill = read_fill(&mut reader, payload_len, index)?;
                    extents.push(Extent {
                        start_block: block,
                        blocks: chunk.chunk_sz,
                        source: ExtentSource::Fill(fill),
                    });
                }
                CHUNK_TYPE_DONT_CARE => {}
                CHUNK_TYPE_CRC32 => reader.seek_relative(payload_len as i64)?,
                other => {
                    return Err(PartimgError::Data(format!(
                        "{}: unknown chunk type {other:#06x}",
                        path.display()
                    )))
                }
            }
            offset += payload_len;
            block += u64::from(chunk.chunk_sz);
        }
        total_blks = total_blks.max(block);
        debug!("{}: {} chunks, {block} blocks", path.display(), header.total_chunks);
    }

    let blk_sz = blk_sz.ok_or_else(|| PartimgError::Data("no chunk files to merge".to_string()))?;
    extents.sort_by_key(|e| e.start_block);

    // data chunks plus one DONT_CARE for every gap
    let mut total_chunks = 0_u32;
    let mut end = 0_u64;
    for extent in &extents {
        if extent.start_block < end {
            return Err(PartimgError::Data(format!(
                "chunk files overlap at block {}",
                extent.start_block
            )));
        }
        if extent.start_block > end {
            total_chunks += 1;
        }
        total_chunks += 1;
        end = extent.start_block + u64::from(extent.blocks);
    }
    if end < total_blks {
        total_chunks += 1;
    }

    let total_blks = u32::try_from(total_blks)
        .map_err(|_| PartimgError::Data(format!("merged image has too many blocks: {total_blks}")))?;
    let mut sources = chunks.iter().map(File::open).collect::<Result<Vec<_>, _>>()?;
    let mut writer = BufWriter::new(File::create(output)?);
    writer.write_all(&SparseHeader::new(blk_sz, total_blks, total_chunks).to_bytes()?)?;

    let mut end = 0_u64;
    for extent in &extents {
        if extent.start_block > end {
            write_dont_care(&mut writer, (extent.start_block - end) as u32)?;
        }
        let data_len = u64::from(extent.blocks) * u64::from(blk_sz);
        match extent.source {
            ExtentSource::Raw { file, offset } => {
                let header = ChunkHeader {
                    chunk_type: CHUNK_TYPE_RAW,
                    reserved1: 0,
                    chunk_sz: extent.blocks,
                    total_sz: CHUNK_HEADER_SIZE as u32 + data_len as u32,
                };
                writer.write_all(&header.to_bytes()?)?;
                let source = &mut sources[file];
                source.seek(SeekFrom::Start(offset))?;
                let copied = io::copy(&mut source.take(data_len), &mut writer)?;
                if copied != data_len {
                    return Err(PartimgError::Data(format!(
                        "{} is truncated",
                        chunks[file].display()
                    )));
                }
            }
            ExtentSource::Fill(fill) => {
                let header = ChunkHeader {
                    chunk_type: CHUNK_TYPE_FILL,
                    reserved1: 0,
                    chunk_sz: extent.blocks,
                    total_sz: CHUNK_HEADER_SIZE as u32 + 4,
                };
                writer.write_all(&header.to_bytes()?)?;
                writer.write_all(&fill)?;
            }
        }
        end = extent.start_block + u64::from(extent.blocks);
    }
    if end < u64::from(total_blks) {
        write_dont_care(&mut writer, (u64::from(total_blks) - end) as u32)?;
    }
    writer.flush()?;
    Ok(())
}

fn write_dont_care<W: Write>(writer: &mut W, blocks: u32) -> Result<(), PartimgError> {
    let header = ChunkHeader {
        chunk_type: CHUNK_TYPE_DONT_CARE,
        reserved1: 0,
        chunk_sz: blocks,
        total_sz: CHUNK_HEADER_SIZE as u32,
    };
    writer.write_all(&header.to_bytes()?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use super::*;

    const BS: u32 = 16;

    fn chunk(chunk_type: u16, chunk_sz: u32, payload: &[u8]) -> Vec<u8> {
        let mut out = ChunkHeader {
            chunk_type,
            reserved1: 0,
            chunk_sz,
            total_sz: (CHUNK_HEADER_SIZE + payload.len()) as u32,
        }
        .to_bytes()
        .unwrap();
        out.extend_from_slice(payload);
        out
    }

    fn image(total_blks: u32, chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = SparseHeader::new(BS, total_blks, chunks.len() as u32).to_bytes().unwrap();
        for c in chunks {
            out.extend_from_slice(c);
        }
        out
    }

    #[test]
    fn header_layout() {
        let bytes = SparseHeader::new(4096, 10, 3).to_bytes().unwrap();
        assert_eq!(bytes.len(), SPARSE_HEADER_SIZE);
        assert_eq!(&bytes[..4], &[0x3A, 0xFF, 0x26, 0xED]);
        assert_eq!(&bytes[12..16], &4096_u32.to_le_bytes());
    }

    #[test]
    fn decode_chunk_types() {
        let raw: Vec<u8> = (0..BS as u8 * 2).collect();
        let sparse = image(
            6,
            &[
                chunk(CHUNK_TYPE_RAW, 2, &raw),
                chunk(CHUNK_TYPE_FILL, 1, &[0xAA, 0xBB, 0xCC, 0xDD]),
                chunk(CHUNK_TYPE_CRC32, 0, &[1, 2, 3, 4]),
                chunk(CHUNK_TYPE_DONT_CARE, 3, &[]),
            ],
        );

        let mut out = Cursor::new(Vec::new());
        let len = unsparse(Cursor::new(sparse), &mut out).unwrap();
        assert_eq!(len, 6 * u64::from(BS));

        let mut out = out.into_inner();
        out.resize(len as usize, 0);
        assert_eq!(&out[..32], &raw[..]);
        assert_eq!(&out[32..36], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert_eq!(&out[44..48], &[0xAA, 0xBB, 0xCC, 0xDD]);
        assert!(out[48..].iter().all(|b| *b == 0));
    }

    #[test]
    fn decode_rejects_short_coverage() {
        let sparse = image(4, &[chunk(CHUNK_TYPE_DONT_CARE, 3, &[])]);
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(unsparse(Cursor::new(sparse), &mut out), Err(PartimgError::Data(_))));
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let mut sparse = image(1, &[chunk(CHUNK_TYPE_DONT_CARE, 1, &[])]);
        sparse[0] = 0;
        let mut out = Cursor::new(Vec::new());
        assert!(matches!(unsparse(Cursor::new(sparse), &mut out), Err(PartimgError::Format(_))));
    }

    #[test]
    fn peek_prefix() {
        let raw = [7_u8; BS as usize];
        let sparse = image(
            4,
            &[
                chunk(CHUNK_TYPE_DONT_CARE, 1, &[]),
                chunk(CHUNK_TYPE_RAW, 1, &raw),
                chunk(CHUNK_TYPE_DONT_CARE, 2, &[]),
            ],
        );
        let prefix = peek(Cursor::new(sparse), 20).unwrap();
        assert_eq!(prefix.len(), 20);
        assert!(prefix[..16].iter().all(|b| *b == 0));
        assert!(prefix[16..].iter().all(|b| *b == 7));
    }

    #[test]
    fn merge_absolute_positions() {
        let dir = tempfile::tempdir().unwrap();
        let a = [1_u8; BS as usize * 2];
        let b = [2_u8; BS as usize];

        let first = dir.path().join("super_1.img");
        fs::write(&first, image(5, &[chunk(CHUNK_TYPE_RAW, 2, &a), chunk(CHUNK_TYPE_DONT_CARE, 3, &[])]))
            .unwrap();
        let second = dir.path().join("super_2.img");
        fs::write(
            &second,
            image(
                5,
                &[
                    chunk(CHUNK_TYPE_DONT_CARE, 3, &[]),
                    chunk(CHUNK_TYPE_RAW, 1, &b),
                    chunk(CHUNK_TYPE_DONT_CARE, 1, &[]),
                ],
            ),
        )
        .unwrap();

        let merged = dir.path().join("super.sparse");
        merge_chunks(&[first, second], &merged).unwrap();

        let raw = dir.path().join("super.raw");
        unsparse_file(&merged, &raw).unwrap();
        let raw = fs::read(raw).unwrap();
        assert_eq!(raw.len(), 5 * BS as usize);
        assert_eq!(&raw[..32], &a[..]);
        assert!(raw[32..48].iter().all(|b| *b == 0));
        assert_eq!(&raw[48..64], &b[..]);
        assert!(raw[64..].iter().all(|b| *b == 0));
    }

    #[test]
    fn merge_rejects_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let data = [1_u8; BS as usize];
        let first = dir.path().join("super_1.img");
        let second = dir.path().join("super_2.img");
        fs::write(&first, image(1, &[chunk(CHUNK_TYPE_RAW, 1, &data)])).unwrap();
        fs::write(&second, image(1, &[chunk(CHUNK_TYPE_RAW, 1, &data)])).unwrap();

        let merged = dir.path().join("super.sparse");
        assert!(matches!(merge_chunks(&[first, second], &merged), Err(PartimgError::Data(_))));
    }
}
