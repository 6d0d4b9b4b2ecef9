//! i.MX Device Configuration Data tables.

use thiserror::Error;

use super::{slice_at, u16_be_at, u32_be_at};

pub const DCD_TAG: u8 = 0xd2;
const CMD_WRITE: u8 = 0xcc;
const CMD_CHECK: u8 = 0xcf;
const CMD_NOP: u8 = 0xc0;
const CMD_UNLOCK: u8 = 0xb2;

const FLAG_MASK: u8 = 0x08;
const FLAG_SET: u8 = 0x10;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DcdError {
    #[error("Invalid DCD tag 0x{0:02x}")]
    InvalidTag(u8),

    #[error("DCD table is truncated")]
    Truncated,

    #[error("DCD command at 0x{offset:x} has invalid length {length}")]
    BadCommandLength { offset: usize, length: usize },

    #[error("Unknown DCD command tag 0x{tag:02x} at 0x{offset:x}")]
    UnknownCommand { tag: u8, offset: usize },

    #[error("Unsupported DCD access width {0}")]
    BadWidth(u8),
}

/// How a write command combines its value with the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Write,
    ClearBits,
    SetBits,
}

/// Condition a check command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOp {
    AllClear,
    AllSet,
    AnyClear,
    AnySet,
}

impl CheckOp {
    pub fn satisfied(self, value: u32, mask: u32) -> bool {
        match self {
            CheckOp::AllClear => value & mask == 0,
            CheckOp::AllSet => value & mask == mask,
            CheckOp::AnyClear => value & mask != mask,
            CheckOp::AnySet => value & mask != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DcdCommand {
    Write {
        width: u8,
        op: WriteOp,
        entries: Vec<(u32, u32)>,
    },
    Check {
        width: u8,
        op: CheckOp,
        address: u32,
        mask: u32,
        /// `None` polls until the condition holds.
        count: Option<u32>,
    },
    Nop,
    Unlock,
}

/// A parsed DCD table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dcd {
    pub version: u8,
    /// Raw table bytes, header included.
    pub raw: Vec<u8>,
    pub commands: Vec<DcdCommand>,
}

fn width(params: u8) -> Result<u8, DcdError> {
    match params & 0x07 {
        w @ (1 | 2 | 4) => Ok(w),
        w => Err(DcdError::BadWidth(w)),
    }
}

impl Dcd {
    /// Parse the DCD table starting at `offset` in `blob`.
    pub fn parse(blob: &[u8], offset: usize) -> Result<Self, DcdError> {
        let tag = *blob.get(offset).ok_or(DcdError::Truncated)?;
        if tag != DCD_TAG {
            return Err(DcdError::InvalidTag(tag));
        }
        let size = u16_be_at(blob, offset + 1).ok_or(DcdError::Truncated)? as usize;
        let raw = slice_at(blob, offset, size).ok_or(DcdError::Truncated)?;
        if size < 4 {
            return Err(DcdError::Truncated);
        }

        let mut commands = Vec::new();
        let mut pos = 4;
        while pos < size {
            let cmd_tag = raw[pos];
            let length = u16_be_at(raw, pos + 1).ok_or(DcdError::Truncated)? as usize;
            let params = *raw.get(pos + 3).ok_or(DcdError::Truncated)?;
            let body = slice_at(raw, pos, length)
                .filter(|_| length >= 4)
                .ok_or(DcdError::BadCommandLength {
                    offset: offset + pos,
                    length,
                })?;
            let word = |i: usize| u32_be_at(body, i).ok_or(DcdError::Truncated);

            let command = match cmd_tag {
                CMD_WRITE => {
                    if (length - 4) % 8 != 0 {
                        return Err(DcdError::BadCommandLength {
                            offset: offset + pos,
                            length,
                        });
                    }
                    let op = match params & (FLAG_MASK | FLAG_SET) {
                        0 | FLAG_SET => WriteOp::Write,
                        FLAG_MASK => WriteOp::ClearBits,
                        _ => WriteOp::SetBits,
                    };
                    let entries = (4..length)
                        .step_by(8)
                        .map(|i| Ok((word(i)?, word(i + 4)?)))
                        .collect::<Result<Vec<_>, DcdError>>()?;
                    DcdCommand::Write {
                        width: width(params)?,
                        op,
                        entries,
                    }
                }
                CMD_CHECK => {
                    let count = match length {
                        12 => None,
                        16 => Some(word(12)?),
                        _ => {
                            return Err(DcdError::BadCommandLength {
                                offset: offset + pos,
                                length,
                            });
                        }
                    };
                    let op = match (params & FLAG_MASK != 0, params & FLAG_SET != 0) {
                        (false, false) => CheckOp::AllClear,
                        (false, true) => CheckOp::AllSet,
                        (true, false) => CheckOp::AnyClear,
                        (true, true) => CheckOp::AnySet,
                    };
                    DcdCommand::Check {
                        width: width(params)?,
                        op,
                        address: word(4)?,
                        mask: word(8)?,
                        count,
                    }
                }
                CMD_NOP => DcdCommand::Nop,
                CMD_UNLOCK => DcdCommand::Unlock,
                other => {
                    return Err(DcdError::UnknownCommand {
                        tag: other,
                        offset: offset + pos,
                    });
                }
            };
            commands.push(command);
            pos += length;
        }

        Ok(Self {
            version: raw[3],
            raw: raw.to_vec(),
            commands,
        })
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
