//! The preldr (preloader) decoder.
//!
//! On MCPX v1.1 consoles a small RSA-gated stage sits between the MCPX ROM
//! and the 2BL: it derives an RC4 key from a per-image nonce and the secret
//! boot key, decrypts the 2BL and verifies it against the ROM digest before
//! jumping into it. This module detects that stage, re-derives the key and
//! performs the same decryption.

use crate::crypto;
use crate::error::Error;
use crate::layout::Layout;
use crate::mcpx::{Mcpx, McpxRevision};
use crate::raw;
use crate::utils::SliceExt;
use crate::{BLDR_BLOCK_SIZE, BOOT_SIGNATURE, PRELDR_REAL_BASE, PRELDR_SIZE, ROM_DIGEST_SIZE};

/// Outcome of the preldr decode step.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PreldrStatus {
    /// A preldr was found and used to decrypt the 2BL.
    BldrDecrypted,
    /// A preldr was found but was not used to decrypt the 2BL.
    Found,
    /// No preldr present; old BIOS (MCPX v1.0) or not a valid BIOS.
    NotFound,
    /// A preldr seems present but its pointers or public key are malformed.
    Error,
}

/// The public key embedded in the preldr code, with the modulus
/// de-obfuscated.
#[derive(Debug)]
pub struct PublicKey {
    bits: u32,
    exponent: u32,
    modulus: raw::Modulus,
}

impl PublicKey {
    /// Key size in bits.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Public exponent.
    pub fn exponent(&self) -> u32 {
        self.exponent
    }

    /// The recovered modulus blob.
    pub fn modulus(&self) -> &[u8] {
        &self.modulus.0
    }
}

/// A decoded preldr.
///
/// All fields are copies decoded out of the image; the decoder never hands
/// out aliased pointers into the buffer.
#[derive(Debug)]
pub struct Preldr {
    params: Option<raw::PreldrParams>,
    ptr_block: Option<raw::PreldrPtrBlock>,
    func_block: Option<raw::PreldrFuncBlock>,
    public_key: Option<PublicKey>,
    bldr_key: Option<[u8; 20]>,
    status: PreldrStatus,
}

impl Preldr {
    pub(crate) fn not_found() -> Self {
        Self {
            params: None,
            ptr_block: None,
            func_block: None,
            public_key: None,
            bldr_key: None,
            status: PreldrStatus::NotFound,
        }
    }

    /// Detects a preldr, recovers its public key, derives the bldr key and
    /// decrypts the 2BL block in place.
    ///
    /// Malformed-preldr conditions are reported through the status and never
    /// mutate the image; the only mutation is the 2BL decryption itself,
    /// which is undone (re-encrypted) when the decrypted block does not
    /// carry the boot signature.
    pub(crate) fn decode(
        data: &mut [u8],
        layout: &Layout,
        mcpx: Option<&Mcpx>,
    ) -> Result<Self, Error> {
        let mut preldr = Self::not_found();

        // MCPX v1.0 jumps straight into the 2BL; whatever sits in the preldr
        // block is code, not a preldr.
        if let Some(mcpx) = mcpx {
            if mcpx.revision() == McpxRevision::V1_0 {
                debug!("MCPX v1.0 supplied, not expecting a preldr");
                return Ok(preldr);
            }
        }

        let params_off = layout.preldr_params_off;
        let mut params_slice =
            data.try_get(params_off..params_off + raw::PreldrParams::SIZE)?;
        let params = raw::PreldrParams::parse(&mut params_slice)?;

        let jmp_offset = params.jmp_offset;
        if jmp_offset == 0 || jmp_offset > PRELDR_SIZE - raw::PreldrPtrBlock::SIZE {
            debug!("no preldr (jmp offset {:#X})", jmp_offset);
            return Ok(preldr);
        }
        preldr.params = Some(params);

        let ptr_off = layout.preldr_off + jmp_offset;
        let mut ptr_slice = data.try_get(ptr_off..ptr_off + raw::PreldrPtrBlock::SIZE)?;
        let ptr_block = raw::PreldrPtrBlock::parse(&mut ptr_slice)?;

        // The function block occupies the next 16-byte-aligned slot after
        // the pointer block.
        let func_offset = (jmp_offset + raw::PreldrPtrBlock::SIZE + 0xF) & !0xF;
        if func_offset + raw::PreldrFuncBlock::SIZE > PRELDR_SIZE {
            warn!("preldr function block out of bounds ({:#X})", func_offset);
            preldr.status = PreldrStatus::Error;
            return Ok(preldr);
        }
        let func_off = layout.preldr_off + func_offset;
        let mut func_slice = data.try_get(func_off..func_off + raw::PreldrFuncBlock::SIZE)?;
        let func_block = raw::PreldrFuncBlock::parse(&mut func_slice)?;

        preldr.ptr_block = Some(ptr_block.clone());
        preldr.func_block = Some(func_block);

        match Self::recover_public_key(data, layout, ptr_block.public_key_addr) {
            Ok(key) => preldr.public_key = Some(key),
            Err(e) => {
                warn!("preldr public key unreadable: {}", e);
                preldr.status = PreldrStatus::Error;
                return Ok(preldr);
            }
        }

        let mcpx = match mcpx {
            Some(mcpx) => mcpx,
            None => {
                info!("preldr present but no MCPX v1.1 secret boot key supplied; 2BL left untouched");
                preldr.status = PreldrStatus::Found;
                return Ok(preldr);
            }
        };

        let nonce = preldr.params.as_ref().map(|p| p.nonce).unwrap_or([0; 16]);
        let bldr_key = crypto::derive_bldr_key(mcpx.sbkey(), &nonce);

        let bldr_off = layout.bldr_off;
        let bldr_block = data.try_get_mut(bldr_off..bldr_off + BLDR_BLOCK_SIZE)?;
        crypto::rc4_apply(&bldr_key, bldr_block)?;

        let params_off = BLDR_BLOCK_SIZE - raw::BootParams::SIZE;
        let mut tail = &bldr_block[params_off as usize..];
        let boot_params = raw::BootParams::parse(&mut tail)?;
        if boot_params.signature == BOOT_SIGNATURE {
            debug!("2BL decrypted with the preldr-derived key");
            Self::check_rom_digest(data, layout)?;
            preldr.bldr_key = Some(bldr_key);
            preldr.status = PreldrStatus::BldrDecrypted;
        } else {
            // Present, but not the authority for this image. Undo the
            // decryption so the caller sees the block byte-exact.
            info!("preldr found but its derived key does not decrypt the 2BL");
            let bldr_block = data.try_get_mut(bldr_off..bldr_off + BLDR_BLOCK_SIZE)?;
            crypto::rc4_apply(&bldr_key, bldr_block)?;
            preldr.status = PreldrStatus::Found;
        }

        Ok(preldr)
    }

    fn recover_public_key(
        data: &[u8],
        layout: &Layout,
        public_key_addr: u32,
    ) -> Result<PublicKey, Error> {
        let rel = public_key_addr
            .checked_sub(PRELDR_REAL_BASE)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "public key address {:#08X} below the preldr base",
                    public_key_addr
                ))
            })?;
        if rel + raw::XbPublicKey::SIZE > PRELDR_SIZE {
            return Err(Error::Malformed(format!(
                "public key address {:#08X} outside the preldr code region",
                public_key_addr
            )));
        }

        let off = layout.preldr_off + rel;
        let mut slice = data.try_get(off..off + raw::XbPublicKey::SIZE)?;
        let key = raw::XbPublicKey::parse(&mut slice)?;

        if &key.header.magic != b"RSA1" {
            return Err(Error::Malformed(format!(
                "bad RSA header magic {:02X?}",
                key.header.magic
            )));
        }
        if key.header.bits != 2048 {
            return Err(Error::Malformed(format!(
                "unexpected RSA key size {} bits",
                key.header.bits
            )));
        }
        if key.header.exponent != 0x10001 {
            return Err(Error::Malformed(format!(
                "unexpected RSA exponent {:#X}",
                key.header.exponent
            )));
        }

        let mut modulus = key.modulus;
        crypto::mask_modulus(&mut modulus.0);
        Ok(PublicKey {
            bits: key.header.bits,
            exponent: key.header.exponent,
            modulus,
        })
    }

    /// Compares the tail of the ROM digest region against the digest of the
    /// plaintext 2BL. A mismatch is logged, not fatal; rebuilt images carry
    /// a fresh digest only when the builder was asked for one.
    fn check_rom_digest(data: &[u8], layout: &Layout) -> Result<(), Error> {
        let digest_region =
            data.try_get(layout.rom_digest_off..layout.rom_digest_off + ROM_DIGEST_SIZE)?;
        let bldr = data.try_get(layout.bldr_off..layout.bldr_off + BLDR_BLOCK_SIZE)?;
        let digest = crypto::sha1(&[bldr]);
        if digest_region[ROM_DIGEST_SIZE as usize - 20..] != digest[..] {
            warn!("ROM digest does not match the decrypted 2BL");
        }
        Ok(())
    }

    pub fn status(&self) -> PreldrStatus {
        self.status
    }

    /// The derived 20-byte bldr key, present once the preldr decrypted the
    /// 2BL.
    pub fn bldr_key(&self) -> Option<&[u8; 20]> {
        self.bldr_key.as_ref()
    }

    /// The preldr parameter struct, if a preldr was detected.
    pub fn params(&self) -> Option<&raw::PreldrParams> {
        self.params.as_ref()
    }

    pub fn ptr_block(&self) -> Option<&raw::PreldrPtrBlock> {
        self.ptr_block.as_ref()
    }

    pub fn func_block(&self) -> Option<&raw::PreldrFuncBlock> {
        self.func_block.as_ref()
    }

    /// The recovered public key, if one was readable.
    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub(crate) fn zeroize(&mut self) {
        if let Some(key) = self.bldr_key.as_mut() {
            *key = [0; 20];
        }
    }
}
