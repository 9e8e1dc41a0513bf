//! Block-based OTA payloads, `<name>.new.dat` written through `<name>.transfer.list`
//!
//! ```text
//! 4            version
//! 262144       total blocks written
//! 0            stash entries (version >= 2)
//! 0            maximum stashed blocks (version >= 2)
//! erase 2,0,262144
//! new 4,0,32,64,96
//! ```
//!
//! A range list is a count followed by that many numbers, forming `[start, end)` block pairs.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::PartimgError;

pub const TRANSFER_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Next blocks of the payload land in these ranges
    New(Vec<(u64, u64)>),
    Erase(Vec<(u64, u64)>),
    Zero(Vec<(u64, u64)>),
}

impl Command {
    fn ranges(&self) -> &[(u64, u64)] {
        match self {
            Self::New(r) | Self::Erase(r) | Self::Zero(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferList {
    pub version: u32,
    pub total_blocks: u64,
    pub commands: Vec<Command>,
}

impl TransferList {
    pub fn parse(text: &str) -> Result<Self, PartimgError> {
        let mut lines = text.lines();
        let version: u32 = parse_number(lines.next(), "version")?;
        if !(1..=4).contains(&version) {
            return Err(PartimgError::Data(format!("unsupported transfer list version {version}")));
        }
        let total_blocks: u64 = parse_number(lines.next(), "total blocks")?;
        if version >= 2 {
            let _stash_entries: u64 = parse_number(lines.next(), "stash entries")?;
            let _max_stash: u64 = parse_number(lines.next(), "maximum stash")?;
        }

        let mut commands = vec![];
        for line in lines.map(str::trim).filter(|l| !l.is_empty()) {
            let (cmd, ranges) = line.split_once(' ').unwrap_or((line, ""));
            let ranges = parse_ranges(ranges.trim())?;
            commands.push(match cmd {
                "new" => Command::New(ranges),
                "erase" => Command::Erase(ranges),
                "zero" => Command::Zero(ranges),
                other => {
                    return Err(PartimgError::Data(format!(
                        "transfer list command {other:?} needs a source image"
                    )))
                }
            });
        }
        debug!("transfer list v{version}: {total_blocks} blocks, {} commands", commands.len());
        Ok(Self { version, total_blocks, commands })
    }

    pub fn from_path(path: &Path) -> Result<Self, PartimgError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// One past the highest block any command touches
    pub fn max_block(&self) -> u64 {
        self.commands.iter().flat_map(|c| c.ranges()).map(|(_, end)| *end).max().unwrap_or(0)
    }

    /// Write the payload blocks of `data` to their ranges in `writer`
    ///
    /// Only `new` ranges carry data, `erase` and `zero` leave the output untouched. Returns the
    /// byte length of the image, [`Self::max_block`] blocks.
    pub fn replay<R: Read, W: Write + Seek>(&self, mut data: R, writer: &mut W) -> Result<u64, PartimgError> {
        for command in &self.commands {
            let Command::New(ranges) = command else {
                continue;
            };
            for (start, end) in ranges {
                let len = (end - start) * TRANSFER_BLOCK_SIZE;
                trace!("new [{start}, {end})");
                writer.seek(SeekFrom::Start(start * TRANSFER_BLOCK_SIZE))?;
                let copied = io::copy(&mut (&mut data).take(len), writer)?;
                if copied != len {
                    return Err(PartimgError::Data(format!(
                        "payload ends inside range [{start}, {end})"
                    )));
                }
            }
        }
        Ok(self.max_block() * TRANSFER_BLOCK_SIZE)
    }

    /// Replay `data` into a new raw image at `output`
    pub fn replay_file(&self, data: &Path, output: &Path) -> Result<(), PartimgError> {
        let reader = BufReader::new(File::open(data)?);
        let mut writer = BufWriter::new(File::create(output)?);
        let len = self.replay(reader, &mut writer)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.set_len(len)?;
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(line: Option<&str>, what: &str) -> Result<T, PartimgError> {
    line.map(str::trim)
        .and_then(|l| l.parse().ok())
        .ok_or_else(|| PartimgError::Data(format!("transfer list {what} is missing or invalid")))
}

fn parse_ranges(text: &str) -> Result<Vec<(u64, u64)>, PartimgError> {
    let bad = || PartimgError::Data(format!("invalid range list {text:?}"));
    let numbers = text.split(',').map(|n| n.parse::<u64>().map_err(|_| bad())).collect::<Result<Vec<_>, _>>()?;
    let (count, values) = numbers.split_first().ok_or_else(bad)?;
    if *count as usize != values.len() || values.len() % 2 != 0 {
        return Err(bad());
    }
    values
        .chunks_exact(2)
        .map(|pair| if pair[0] <= pair[1] { Ok((pair[0], pair[1])) } else { Err(bad()) })
        .collect()
}
