//! Register file save states: a short header followed by the context image.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::context::Sh4Context;

pub const STATE_MAGIC: [u8; 4] = *b"SH4C";
pub const STATE_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("not a cpu state (magic {0:02x?})")]
    InvalidMagic([u8; 4]),

    #[error("unsupported cpu state version {0}")]
    UnsupportedVersion(u16),

    #[error("context image is {found} bytes, expected {expected}")]
    SizeMismatch { found: u32, expected: u32 },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub fn serialize<W: Write + ?Sized>(ctx: &Sh4Context, writer: &mut W) -> Result<(), StateError> {
    writer.write_all(&STATE_MAGIC)?;
    writer.write_all(&STATE_VERSION.to_le_bytes())?;
    writer.write_all(&(Sh4Context::SIZE as u32).to_le_bytes())?;
    writer.write_all(bytemuck::bytes_of(ctx))?;
    Ok(())
}

/// Restores `ctx`. On error `ctx` is left untouched.
pub fn deserialize<R: Read + ?Sized>(ctx: &mut Sh4Context, reader: &mut R) -> Result<(), StateError> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != STATE_MAGIC {
        return Err(StateError::InvalidMagic(magic));
    }

    let mut word = [0u8; 2];
    reader.read_exact(&mut word)?;
    let version = u16::from_le_bytes(word);
    if version != STATE_VERSION {
        return Err(StateError::UnsupportedVersion(version));
    }

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let found = u32::from_le_bytes(len);
    if found as usize != Sh4Context::SIZE {
        return Err(StateError::SizeMismatch {
            found,
            expected: Sh4Context::SIZE as u32,
        });
    }

    let mut image = [0u8; Sh4Context::SIZE];
    reader.read_exact(&mut image)?;
    *ctx = bytemuck::pod_read_unaligned(&image);
    log::debug!("state: restored context, pc {:#010x}", ctx.pc);
    Ok(())
}
