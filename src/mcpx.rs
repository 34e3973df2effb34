//! The MCPX southbridge boot ROM, provider of the secret boot key.
//!
//! The MCPX ROM is not part of the BIOS image; it is fused into the
//! southbridge and shadowed over the top of the memory map at reset. The
//! codec only needs two things from it: the 16-byte secret boot key and the
//! revision (v1.0 consoles carry no preldr).

use crate::error::Error;
use crate::utils::Key;
use crate::MCPX_BLOCK_SIZE;

/// Offset of the secret boot key inside the MCPX ROM.
const SBKEY_OFFSET: usize = 0x19C;

/// MCPX southbridge revision.
///
/// The revision decides the boot path: v1.0 jumps straight into the 2BL,
/// v1.1 runs the preldr first.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum McpxRevision {
    /// MCPX v1.0; no preldr expected.
    V1_0,
    /// MCPX v1.1; a preldr decrypts and verifies the 2BL.
    V1_1,
}

/// A loaded MCPX ROM.
#[derive(Debug, Clone)]
pub struct Mcpx {
    revision: McpxRevision,
    sbkey: Key,
}

impl Mcpx {
    /// Wraps a 512-byte MCPX ROM dump.
    ///
    /// The revision is named by the caller; identifying a ROM by digest
    /// would mean shipping key material, which this crate does not do.
    pub fn from_rom(revision: McpxRevision, rom: &[u8]) -> Result<Self, Error> {
        if rom.len() != MCPX_BLOCK_SIZE as usize {
            return Err(Error::Malformed(format!(
                "MCPX ROM is {} bytes, expected {:#X}",
                rom.len(),
                MCPX_BLOCK_SIZE
            )));
        }
        let mut sbkey = [0; 16];
        sbkey.copy_from_slice(&rom[SBKEY_OFFSET..SBKEY_OFFSET + 16]);
        Ok(Self {
            revision,
            sbkey: Key(sbkey),
        })
    }

    /// Builds a provider from a bare secret boot key, for callers that have
    /// the key but not a full ROM dump.
    pub fn from_sbkey(revision: McpxRevision, sbkey: [u8; 16]) -> Self {
        Self {
            revision,
            sbkey: Key(sbkey),
        }
    }

    pub fn revision(&self) -> McpxRevision {
        self.revision
    }

    /// The 16-byte secret boot key.
    pub fn sbkey(&self) -> &[u8; 16] {
        &self.sbkey.0
    }

    pub(crate) fn zeroize(&mut self) {
        self.sbkey = Key([0; 16]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbkey_is_read_from_the_rom() {
        let mut rom = vec![0u8; MCPX_BLOCK_SIZE as usize];
        rom[SBKEY_OFFSET..SBKEY_OFFSET + 16].copy_from_slice(&[0xC3; 16]);

        let mcpx = Mcpx::from_rom(McpxRevision::V1_1, &rom).unwrap();
        assert_eq!(mcpx.sbkey(), &[0xC3; 16]);
        assert_eq!(mcpx.revision(), McpxRevision::V1_1);

        assert!(Mcpx::from_rom(McpxRevision::V1_0, &rom[..0x100]).is_err());
    }
}
