//! Assembles a fresh BIOS image from independently supplied components.
//!
//! The build direction is the inverse of `load`: components are written
//! into their canonical slots, the boot parameters and key slots are
//! patched, digests are computed, and only then is anything encrypted.
//! The order is fixed: layout, plaintext fields, boot params, digests,
//! kernel encryption, 2BL encryption. Reversing any pair invalidates the
//! digests or the signature.

use byteorder::{ByteOrder, LE};

use crate::crypto;
use crate::error::Error;
use crate::layout::{self, Layout};
use crate::mcpx::McpxRevision;
use crate::preldr::{Preldr, PreldrStatus};
use crate::raw;
use crate::utils::SliceExt;
use crate::{
    LoadParams, BLDR_BLOCK_SIZE, BOOT_SIGNATURE, KD_DELAY_FLAG, PRELDR_BLOCK_SIZE,
    ROM_DIGEST_SIZE,
};

bitflags! {
    /// Flags that alter how an image is synthesized.
    pub struct BuildFlags: u32 {
        /// Embed the boot-from-media key (the 2BL key) into the 2BL.
        const BFM             = 0x01;
        /// Skip the init-table checksum fixup.
        const HACK_INITTBL    = 0x02;
        /// Leave the boot-params signature as supplied instead of writing
        /// the boot signature.
        const HACK_SIGNATURE  = 0x04;
        /// Do not write the boot-params block at all.
        const NO_BOOT_PARAMS  = 0x08;
        /// Zero the in-image kernel key and mark the kernel key as
        /// externally supplied.
        const ZERO_KERNEL_KEY = 0x10;
        /// Recompute and embed the ROM digest of the 2BL.
        const FIX_2BL_DIGEST  = 0x20;
    }
}

/// Components and flags consumed by [`Bios::build`].
///
/// [`Bios::build`]: ../struct.Bios.html#method.build
#[derive(Debug)]
pub struct BuildParams {
    /// Init table blob, written at the bottom of the image.
    pub init_tbl: Vec<u8>,
    /// Preldr blob (code + params), written into the preldr block.
    pub preldr: Option<Vec<u8>>,
    /// Plaintext 2BL blob, written into the 2BL block.
    pub bldr: Vec<u8>,
    /// Compressed kernel image, written immediately below the 2BL block.
    pub compressed_kernel: Vec<u8>,
    /// Kernel data section, written adjacent below the compressed kernel.
    pub kernel_data: Vec<u8>,
    /// Replacement EEPROM key for the 2BL key block.
    pub eeprom_key: Option<[u8; 16]>,
    /// Replacement certificate key for the 2BL key block.
    pub cert_key: Option<[u8; 16]>,
    pub flags: BuildFlags,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            init_tbl: Vec::new(),
            preldr: None,
            bldr: Vec::new(),
            compressed_kernel: Vec::new(),
            kernel_data: Vec::new(),
            eeprom_key: None,
            cert_key: None,
            flags: BuildFlags::empty(),
        }
    }
}

/// Assembles a plaintext image of `binsize` bytes: components in their
/// canonical slots, boot params and key slots patched, digests computed.
///
/// Encryption and replication are applied separately by [`finalize`] so the
/// caller can decode the entities while everything is still plaintext.
pub(crate) fn assemble(
    build_params: &BuildParams,
    binsize: u32,
    params: &LoadParams,
) -> Result<Vec<u8>, Error> {
    let layout = Layout::resolve(binsize)?;
    let mut data = vec![0u8; binsize as usize];

    let krnl_size = build_params.compressed_kernel.len() as u32;
    let krnl_data_size = build_params.kernel_data.len() as u32;
    let inittbl_size = build_params.init_tbl.len() as u32;

    let krnl_off = layout.krnl_off(krnl_size)?;
    let data_off = layout.krnl_data_off(krnl_size, krnl_data_size)?;
    if inittbl_size > data_off {
        return Err(Error::Malformed(format!(
            "components do not fit: init table ({:#X} bytes) overlaps the kernel data at {:#X}",
            inittbl_size, data_off
        )));
    }
    if build_params.bldr.len() as u32 > BLDR_BLOCK_SIZE {
        return Err(Error::Malformed(format!(
            "2BL is {:#X} bytes, the block holds {:#X}",
            build_params.bldr.len(),
            BLDR_BLOCK_SIZE
        )));
    }
    if let Some(preldr) = &build_params.preldr {
        if preldr.len() as u32 > PRELDR_BLOCK_SIZE {
            return Err(Error::Malformed(format!(
                "preldr is {:#X} bytes, the block holds {:#X}",
                preldr.len(),
                PRELDR_BLOCK_SIZE
            )));
        }
    }

    // Populate every slot in plaintext first.
    write_at(&mut data, layout.inittbl_off, &build_params.init_tbl)?;
    if let Some(preldr) = &build_params.preldr {
        write_at(&mut data, layout.preldr_off, preldr)?;
    }
    write_at(&mut data, layout.bldr_off, &build_params.bldr)?;
    write_at(&mut data, krnl_off, &build_params.compressed_kernel)?;
    write_at(&mut data, data_off, &build_params.kernel_data)?;

    patch_keys(&mut data, &layout, build_params, params)?;

    if !build_params.flags.contains(BuildFlags::NO_BOOT_PARAMS) {
        patch_boot_params(&mut data, &layout, build_params, krnl_size, krnl_data_size, inittbl_size)?;
    }

    if !build_params.flags.contains(BuildFlags::HACK_INITTBL) {
        fixup_inittbl_checksum(&mut data, inittbl_size)?;
    }

    if build_params.flags.contains(BuildFlags::FIX_2BL_DIGEST) {
        let digest_block = {
            let bldr = data.try_get(layout.bldr_off..layout.bldr_off + BLDR_BLOCK_SIZE)?;
            crypto::rom_digest_block(bldr)
        };
        write_at(&mut data, layout.rom_digest_off, &digest_block)?;
        debug_assert_eq!(digest_block.len() as u32, ROM_DIGEST_SIZE);
    }

    Ok(data)
}

/// Encrypts the assembled image (kernel and data first, then the 2BL) and
/// tiles it up to `params.romsize` when that is larger.
///
/// The order is load-bearing: the ROM digest and the boot-params digest
/// cover plaintext, and the 2BL key block must still be readable while the
/// kernel is being encrypted.
pub(crate) fn finalize(
    data: &mut Vec<u8>,
    layout: &Layout,
    build_params: &BuildParams,
    params: &LoadParams,
) -> Result<(), Error> {
    if params.enc_kernel {
        let krnl_size = build_params.compressed_kernel.len() as u32;
        let krnl_data_size = build_params.kernel_data.len() as u32;
        let krnl_off = layout.krnl_off(krnl_size)?;
        let data_off = layout.krnl_data_off(krnl_size, krnl_data_size)?;
        encrypt_kernel(
            data,
            layout,
            build_params,
            params,
            krnl_off,
            krnl_size,
            data_off,
            krnl_data_size,
        )?;
    }

    if params.enc_bldr {
        encrypt_bldr(data, layout, params)?;
    }

    if params.romsize > layout.romsize {
        layout::replicate(data, params.romsize)?;
    }

    Ok(())
}

fn write_at(data: &mut [u8], off: u32, bytes: &[u8]) -> Result<(), Error> {
    if bytes.is_empty() {
        return Ok(());
    }
    let end = off
        .checked_add(bytes.len() as u32)
        .ok_or_else(|| Error::addr_overflow(off, bytes.len() as u32))?;
    data.try_get_mut(off..end)?.copy_from_slice(bytes);
    Ok(())
}

/// Resolves the 2BL entry descriptor out of the freshly written block.
fn resolve_entry(data: &[u8], layout: &Layout) -> Result<raw::BldrEntry, Error> {
    let off = layout.bldr_entry_off;
    let mut slice = data.try_get(off..off + raw::BldrEntry::SIZE)?;
    raw::BldrEntry::parse(&mut slice)
}

/// Patches the key slots of the 2BL key block according to the build flags.
fn patch_keys(
    data: &mut [u8],
    layout: &Layout,
    build_params: &BuildParams,
    params: &LoadParams,
) -> Result<(), Error> {
    let flags = build_params.flags;
    let wants_patch = build_params.eeprom_key.is_some()
        || build_params.cert_key.is_some()
        || flags.contains(BuildFlags::BFM)
        || flags.contains(BuildFlags::ZERO_KERNEL_KEY);
    if !wants_patch {
        return Ok(());
    }

    let entry = resolve_entry(data, layout)?;
    let keys_off = layout.bldr_addr_to_off(entry.keys_addr, raw::BldrKeys::SIZE)?;

    if let Some(key) = &build_params.eeprom_key {
        write_at(data, keys_off, key)?;
    }
    if let Some(key) = &build_params.cert_key {
        write_at(data, keys_off + 0x10, key)?;
    }
    if flags.contains(BuildFlags::ZERO_KERNEL_KEY) {
        write_at(data, keys_off + 0x20, &[0; 16])?;
    }

    if flags.contains(BuildFlags::BFM) {
        let bfm_key = params
            .bldr_key
            .as_ref()
            .ok_or(Error::KeyMissing("bldr key (required to embed a BFM key)"))?;
        if entry.bfm_key_addr == 0 {
            return Err(Error::Malformed(
                "2BL carries no boot-from-media key slot".to_string(),
            ));
        }
        let bfm_off = layout.bldr_addr_to_off(entry.bfm_key_addr, 16)?;
        write_at(data, bfm_off, &bfm_key.0)?;
    }

    Ok(())
}

/// Rewrites the boot parameter block at the tail of the 2BL.
fn patch_boot_params(
    data: &mut [u8],
    layout: &Layout,
    build_params: &BuildParams,
    krnl_size: u32,
    krnl_data_size: u32,
    inittbl_size: u32,
) -> Result<(), Error> {
    let off = layout.boot_params_off;
    let mut slice = data.try_get(off..off + raw::BootParams::SIZE)?;
    let mut boot_params = raw::BootParams::parse(&mut slice)?;

    boot_params.krnl_size = krnl_size;
    boot_params.krnl_data_size = krnl_data_size;
    boot_params.inittbl_size = inittbl_size;
    if !build_params.flags.contains(BuildFlags::HACK_SIGNATURE) {
        boot_params.signature = BOOT_SIGNATURE;
    }
    if build_params.flags.contains(BuildFlags::ZERO_KERNEL_KEY) {
        boot_params.krnl_key_addr |= KD_DELAY_FLAG;
    }
    boot_params.digest = crypto::sha1(&[
        &build_params.kernel_data[..],
        &build_params.compressed_kernel[..],
    ]);

    let region = data.try_get_mut(off..off + raw::BootParams::SIZE)?;
    boot_params.write(region)
}

/// Writes the init-table checksum so the table's `u32` words sum to zero.
///
/// Tables shorter than the fixed header carry no checksum slot and are left
/// untouched.
fn fixup_inittbl_checksum(data: &mut [u8], inittbl_size: u32) -> Result<(), Error> {
    if inittbl_size < raw::InitTbl::SIZE {
        debug!("init table too short for a checksum slot, leaving it as-is");
        return Ok(());
    }
    let region = data.try_get_mut(0..inittbl_size)?;
    let slot = raw::InitTbl::CHECKSUM_OFFSET as usize;
    LE::write_u32(&mut region[slot..slot + 4], 0);

    let mut sum: u32 = 0;
    for word in region.chunks_exact(4) {
        sum = sum.wrapping_add(LE::read_u32(word));
    }
    LE::write_u32(&mut region[slot..slot + 4], sum.wrapping_neg());
    Ok(())
}

/// Encrypts the compressed kernel and data section under their keys.
fn encrypt_kernel(
    data: &mut [u8],
    layout: &Layout,
    build_params: &BuildParams,
    params: &LoadParams,
    krnl_off: u32,
    krnl_size: u32,
    data_off: u32,
    krnl_data_size: u32,
) -> Result<(), Error> {
    let keys = match resolve_entry(data, layout)
        .and_then(|entry| layout.bldr_addr_to_off(entry.keys_addr, raw::BldrKeys::SIZE))
    {
        Ok(keys_off) => {
            let mut slice = data.try_get(keys_off..keys_off + raw::BldrKeys::SIZE)?;
            Some(raw::BldrKeys::parse(&mut slice)?)
        }
        Err(e) => {
            debug!("2BL key block unavailable while encrypting the kernel: {}", e);
            None
        }
    };

    let key = if build_params.flags.contains(BuildFlags::ZERO_KERNEL_KEY) {
        Some(
            params
                .kernel_key
                .as_ref()
                .ok_or(Error::KeyMissing("kernel key (in-image key is zeroed)"))?
                .0,
        )
    } else {
        keys.as_ref().map(|k| k.krnl_key)
    };

    match key {
        Some(key) if key != [0; 16] => {
            let region = data.try_get_mut(krnl_off..krnl_off + krnl_size)?;
            crypto::rc4_apply(&key, region)?;
        }
        _ => debug!("kernel key is zero; compressed kernel left plaintext"),
    }

    match keys.as_ref().map(|k| k.krnl_data_key) {
        Some(key) if key != [0; 16] => {
            let region = data.try_get_mut(data_off..data_off + krnl_data_size)?;
            crypto::rc4_apply(&key, region)?;
        }
        _ => debug!("kernel data key is zero; data section left plaintext"),
    }

    Ok(())
}

/// Encrypts the 2BL block, under the preldr-derived key when the written
/// preldr would validate and an MCPX v1.1 secret boot key is at hand, under
/// the supplied 2BL key otherwise.
///
/// The authority decision mirrors the loader: a preldr with an out-of-range
/// jump offset or a broken public key will not decrypt the 2BL on load, so
/// it must not encrypt it here either.
fn encrypt_bldr(
    data: &mut [u8],
    layout: &Layout,
    params: &LoadParams,
) -> Result<(), Error> {
    let derived = match &params.mcpx {
        Some(mcpx) if mcpx.revision() == McpxRevision::V1_1 => {
            let probe = Preldr::decode(data, layout, None)?;
            if probe.status() == PreldrStatus::Found {
                let nonce = probe.params().map(|p| p.nonce).unwrap_or([0; 16]);
                Some(crypto::derive_bldr_key(mcpx.sbkey(), &nonce))
            } else {
                None
            }
        }
        _ => None,
    };

    let block = data.try_get_mut(layout.bldr_off..layout.bldr_off + BLDR_BLOCK_SIZE)?;
    match derived {
        Some(key) => crypto::rc4_apply(&key, block),
        None => {
            let key = params
                .bldr_key
                .as_ref()
                .ok_or(Error::KeyMissing("bldr key (required to encrypt the 2BL)"))?;
            crypto::rc4_apply(&key.0, block)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inittbl_checksum_makes_words_sum_to_zero() {
        let mut data = vec![0u8; 0x40000];
        for (i, byte) in data.iter_mut().take(0x100).enumerate() {
            *byte = (i * 13) as u8;
        }
        fixup_inittbl_checksum(&mut data, 0x100).unwrap();

        let mut sum: u32 = 0;
        for word in data[..0x100].chunks_exact(4) {
            sum = sum.wrapping_add(LE::read_u32(word));
        }
        assert_eq!(sum, 0);
    }

    #[test]
    fn short_inittbl_is_left_untouched() {
        let mut data = vec![0xEEu8; 0x40000];
        fixup_inittbl_checksum(&mut data, 0x10).unwrap();
        assert!(data[..0x10].iter().all(|&b| b == 0xEE));
    }
}
