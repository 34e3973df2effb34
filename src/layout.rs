//! Computes the byte offsets of every nested region of a BIOS image.
//!
//! All regions are anchored to the *top* of the image, mirroring the
//! hardware memory map that ends at `0xFFFF_FFFF`: the MCPX window is always
//! last, the preldr block sits immediately before it, and the 2BL block
//! immediately before that. The compressed kernel and its data section grow
//! downward from the 2BL base and are located through the 2BL's boot
//! parameters once those are plaintext.

use crate::error::Error;
use crate::{
    BLDR_BLOCK_SIZE, MAX_BIOS_SIZE, MCPX_BLOCK_SIZE, MIN_BIOS_SIZE, PRELDR_BLOCK_SIZE,
    PRELDR_PARAMS_SIZE, PRELDR_SIZE,
};
use crate::raw::BootParams;

/// Offset of the 2BL entry descriptor from the 2BL base.
const BLDR_ENTRY_OFFSET: u32 = 0x40;

/// Resolved offsets of every fixed region of an image.
///
/// Produced by [`Layout::resolve`]; pure data, no access to the image
/// buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// The logical window size the offsets were computed for.
    pub romsize: u32,
    /// Start of the MCPX shadow window; always the final region.
    pub mcpx_off: u32,
    /// Start of the preldr block.
    pub preldr_off: u32,
    /// Start of the preldr parameter struct inside the preldr block.
    pub preldr_params_off: u32,
    /// Start of the 256-byte ROM digest region at the top of the preldr
    /// block.
    pub rom_digest_off: u32,
    /// Start of the 2BL block.
    pub bldr_off: u32,
    /// Start of the boot parameter block at the tail of the 2BL block.
    pub boot_params_off: u32,
    /// Start of the 2BL entry descriptor.
    pub bldr_entry_off: u32,
    /// Start of the init table.
    pub inittbl_off: u32,
}

impl Layout {
    /// Computes the region offsets for an image of `romsize` bytes.
    ///
    /// Fails with [`Error::InvalidSize`] unless `romsize` is one of the
    /// allowed sizes.
    pub fn resolve(romsize: u32) -> Result<Self, Error> {
        if !check_size(romsize) {
            return Err(Error::InvalidSize(romsize));
        }

        let mcpx_off = romsize - MCPX_BLOCK_SIZE;
        let preldr_off = mcpx_off - PRELDR_BLOCK_SIZE;
        let bldr_off = preldr_off - BLDR_BLOCK_SIZE;

        Ok(Self {
            romsize,
            mcpx_off,
            preldr_off,
            preldr_params_off: preldr_off + PRELDR_SIZE,
            rom_digest_off: preldr_off + PRELDR_SIZE + PRELDR_PARAMS_SIZE,
            bldr_off,
            boot_params_off: bldr_off + BLDR_BLOCK_SIZE - BootParams::SIZE,
            bldr_entry_off: bldr_off + BLDR_ENTRY_OFFSET,
            inittbl_off: 0,
        })
    }

    /// Offset of the compressed kernel for the given size from the boot
    /// params.
    ///
    /// The kernel sits immediately below the 2BL block.
    pub fn krnl_off(&self, krnl_size: u32) -> Result<u32, Error> {
        self.bldr_off.checked_sub(krnl_size).ok_or_else(|| {
            Error::Malformed(format!(
                "compressed kernel size {:#X} larger than the space below the 2BL",
                krnl_size
            ))
        })
    }

    /// Offset of the kernel data section, adjacent below the compressed
    /// kernel.
    pub fn krnl_data_off(&self, krnl_size: u32, krnl_data_size: u32) -> Result<u32, Error> {
        self.krnl_off(krnl_size)?
            .checked_sub(krnl_data_size)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "kernel data size {:#X} larger than the space below the kernel",
                    krnl_data_size
                ))
            })
    }

    /// Converts a `BLDR_BASE`-relative address from a 2BL structure into an
    /// image offset, checking that `size` bytes starting there stay inside
    /// the 2BL block.
    pub fn bldr_addr_to_off(&self, addr: u32, size: u32) -> Result<u32, Error> {
        let rel = addr.checked_sub(crate::BLDR_BASE).ok_or_else(|| {
            Error::Malformed(format!("2BL address {:#08X} below the 2BL boot base", addr))
        })?;
        let end = rel
            .checked_add(size)
            .ok_or_else(|| Error::addr_overflow(rel, size))?;
        if end > BLDR_BLOCK_SIZE {
            return Err(Error::Malformed(format!(
                "2BL address {:#08X} points outside the 2BL block",
                addr
            )));
        }
        Ok(self.bldr_off + rel)
    }
}

/// Returns `true` if `size` is an allowed image size (256 KiB, 512 KiB or
/// 1 MiB).
pub fn check_size(size: u32) -> bool {
    size >= MIN_BIOS_SIZE && size <= MAX_BIOS_SIZE && size.is_power_of_two()
}

/// Tiles `data` until it is `to` bytes long.
///
/// The logical BIOS image is always a full window as seen by the CPU;
/// smaller files are replicas of a valid prefix. `to` must be an allowed
/// size and a multiple of the current length. Replicating to the current
/// length is a no-op, which makes the operation idempotent.
pub fn replicate(data: &mut Vec<u8>, to: u32) -> Result<(), Error> {
    let from = data.len() as u32;
    if !check_size(from) {
        return Err(Error::InvalidSize(from));
    }
    if !check_size(to) || to < from {
        return Err(Error::InvalidSize(to));
    }
    if to == from {
        return Ok(());
    }

    data.reserve((to - from) as usize);
    while (data.len() as u32) < to {
        for i in 0..from as usize {
            let b = data[i];
            data.push(b);
        }
    }
    debug_assert_eq!(data.len() as u32, to);
    Ok(())
}
