//! Parser and builder for the BIOS ROM images used by the original Xbox.
//!
//! A BIOS image is a layered, self-verifying blob: an init table at the
//! bottom, a compressed kernel and its data section in the middle, and a
//! second-stage boot loader (2BL) plus an optional preloader (preldr) at
//! the top, directly below the window the MCPX boot ROM is shadowed into.
//! Most of the layers are RC4-encrypted and chained together through SHA-1
//! digests.
//!
//! The most important type is [`Bios`], which owns an image buffer and
//! walks the layers in order: locate the regions, detect and run the
//! preldr, decrypt and validate the 2BL, then decrypt and decompress the
//! kernel. The inverse direction is [`Bios::build`], which assembles a
//! fresh image from independently supplied components such that it decodes
//! back to the same components.
//!
//! Most of the information in here is derived from the
//! [xboxdevwiki pages on the boot process][website].
//!
//! [website]: https://xboxdevwiki.net/Boot_Process
//! [`Bios`]: struct.Bios.html
//! [`Bios::build`]: struct.Bios.html#method.build

#![doc(html_root_url = "https://docs.rs/xbios/0.1.0")]
#![warn(missing_debug_implementations)]
#![forbid(unsafe_code)]

// Deny unchecked slice indexing when using clippy. This can almost always
// result in a panic with a malformed BIOS.
#![cfg_attr(feature = "cargo-clippy", deny(indexing_slicing))]
#![cfg_attr(feature = "cargo-clippy", allow(unreadable_literal, large_digit_groups))]

#[macro_use] extern crate bitflags;
#[macro_use] extern crate log;
#[macro_use] extern crate serde_derive;
extern crate serde;
extern crate bincode;
extern crate byteorder;
extern crate lzxd;
extern crate rc4;
extern crate sha1;

pub mod bldr;
mod build;
mod crypto;
mod error;
pub mod kernel;
pub mod layout;
pub mod mcpx;
pub mod preldr;
pub mod raw;
mod utils;

pub use crate::build::{BuildFlags, BuildParams};
pub use crate::crypto::derive_bldr_key;
pub use crate::error::Error;
pub use crate::mcpx::{Mcpx, McpxRevision};
pub use crate::utils::Key;
use crate::bldr::Bldr;
use crate::kernel::Kernel;
use crate::layout::Layout;
use crate::preldr::{Preldr, PreldrStatus};
use crate::utils::{NoDebug, SliceExt};

/// Minimum BIOS file size in bytes (256 KiB).
pub const MIN_BIOS_SIZE: u32 = 0x40000;
/// Maximum BIOS file size in bytes (1 MiB).
pub const MAX_BIOS_SIZE: u32 = 0x100000;

/// Size of the MCPX shadow window at the top of the image.
pub const MCPX_BLOCK_SIZE: u32 = 0x200;

/// Size of the preldr block.
pub const PRELDR_BLOCK_SIZE: u32 = 0x2A00;
/// Size of the preldr parameter struct.
pub const PRELDR_PARAMS_SIZE: u32 = 0x80;
/// Size of the ROM digest region at the top of the preldr block.
pub const ROM_DIGEST_SIZE: u32 = 0x100;
/// Size of the preldr code region.
pub const PRELDR_SIZE: u32 = PRELDR_BLOCK_SIZE - ROM_DIGEST_SIZE - PRELDR_PARAMS_SIZE;
/// Size of the preldr nonce.
pub const PRELDR_NONCE_SIZE: u32 = 0x10;
/// Address of the preldr block in the CPU's top-of-memory map.
pub const PRELDR_REAL_BASE: u32 = 0xFFFF_FFFF - MCPX_BLOCK_SIZE - PRELDR_BLOCK_SIZE + 1;

/// Size of the 2BL block.
pub const BLDR_BLOCK_SIZE: u32 = 0x6000;
/// Address the 2BL executes from once the preldr relocated it.
pub const BLDR_RELOC: u32 = 0x0040_0000;
/// Boot base address of the 2BL; addresses inside 2BL structures are
/// relative to this.
pub const BLDR_BASE: u32 = 0x0009_0000;

/// The 2BL boot-params signature, "JyTx" in little-endian.
pub const BOOT_SIGNATURE: u32 = 2018801994;

/// High bit of the boot-params kernel-key word: the kernel key is supplied
/// externally instead of being read from the image.
pub const KD_DELAY_FLAG: u32 = 0x8000_0000;

/// Entry point used by the TEA-collision attack against the v1.0 2BL.
///
/// Exposed for inspection tools only; nothing in this crate jumps anywhere.
pub const PRELDR_TEA_ATTACK_ENTRY_POINT: u32 = 0x007F_D588;

/// Whether a region of the image is currently encrypted.
///
/// Decoders only ever move entities towards `Plaintext`; an entity never
/// becomes ciphertext again by a decoder step, and decrypting twice is
/// refused.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EncryptionState {
    /// The region holds RC4 ciphertext.
    Ciphertext,
    /// The region has been decrypted (or was never encrypted).
    Plaintext,
}

/// Overall outcome of loading a BIOS, for images that could be parsed at
/// all.
///
/// Hard failures (wrong size, unreadable structures, missing keys) are
/// returned as [`Error`]s instead and leave no handle behind.
///
/// [`Error`]: enum.Error.html
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// The image decoded fully.
    Success,
    /// The 2BL failed its signature or size checks. The image stays
    /// inspectable; the kernel is not touched.
    InvalidBldr,
}

/// Parameters for [`Bios::load`].
///
/// The defaults describe the common case: the image is encrypted, the rom
/// size equals the file size, and no external keys are available.
///
/// [`Bios::load`]: struct.Bios.html#method.load
#[derive(Debug, Clone)]
pub struct LoadParams {
    /// Logical rom size in bytes; 0 means the file size.
    ///
    /// Files smaller than this are tiled replicas filling the window.
    pub romsize: u32,
    /// RC4 key for the 2BL, used when no preldr decrypts it.
    pub bldr_key: Option<Key>,
    /// External kernel key, used when the boot params carry
    /// [`KD_DELAY_FLAG`].
    ///
    /// [`KD_DELAY_FLAG`]: constant.KD_DELAY_FLAG.html
    pub kernel_key: Option<Key>,
    /// The MCPX boot ROM, provider of the secret boot key.
    pub mcpx: Option<Mcpx>,
    /// Whether the 2BL in the image is encrypted.
    pub enc_bldr: bool,
    /// Whether the kernel and its data section are encrypted.
    pub enc_kernel: bool,
    /// Zero the boot-params region of the decrypted 2BL after decoding,
    /// leaving a build-ready 2BL in the buffer.
    pub restore_boot_params: bool,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            romsize: 0,
            bldr_key: None,
            kernel_key: None,
            mcpx: None,
            enc_bldr: true,
            enc_kernel: true,
            restore_boot_params: false,
        }
    }
}

/// An Xbox BIOS image.
///
/// Created by [`load`] (parse an existing image) or [`build`] (synthesize a
/// fresh one). The handle exclusively owns the image buffer; decoder steps
/// mutate it in a fixed sequence and [`unload`] (also the drop path) zeroes
/// all derived key material.
///
/// [`load`]: #method.load
/// [`build`]: #method.build
/// [`unload`]: #method.unload
#[derive(Debug)]
pub struct Bios {
    /// The owned image buffer, replicated to the full logical window.
    data: NoDebug<Vec<u8>>,
    layout: Layout,
    status: LoadStatus,
    init_tbl: raw::InitTbl,
    preldr: Preldr,
    bldr: Bldr,
    /// Present once the 2BL validated and located the kernel.
    kernel: Option<Kernel>,
    params: LoadParams,
}

impl Bios {
    /// Loads a BIOS from memory, consuming the buffer.
    ///
    /// Runs the full decode sequence: replicate to the logical window,
    /// resolve the layout, detect and run the preldr, decrypt and validate
    /// the 2BL, then decrypt and decompress the kernel. Soft conditions (an
    /// invalid 2BL, a failing kernel decompression) are reported through
    /// [`status`] and warnings rather than errors.
    ///
    /// [`status`]: #method.status
    pub fn load(buff: Vec<u8>, params: LoadParams) -> Result<Self, Error> {
        if buff.len() > MAX_BIOS_SIZE as usize {
            return Err(Error::InvalidSize(MAX_BIOS_SIZE + 1));
        }
        let binsize = buff.len() as u32;
        if !layout::check_size(binsize) {
            return Err(Error::InvalidSize(binsize));
        }

        let romsize = if params.romsize == 0 {
            binsize
        } else {
            params.romsize
        };

        let mut data = buff;
        layout::replicate(&mut data, romsize)?;
        let layout = Layout::resolve(romsize)?;

        let init_tbl = raw::InitTbl::parse(&mut &data[..])?;

        let preldr = Preldr::decode(&mut data, &layout, params.mcpx.as_ref())?;
        let preldr_decrypted = preldr.status() == PreldrStatus::BldrDecrypted;

        let bldr = Bldr::decode(&mut data, &layout, &params, preldr_decrypted)?;

        let mut status = LoadStatus::Success;
        let mut kernel = None;
        if bldr.is_valid() {
            let mut k = Kernel::resolve(&layout, bldr.boot_params(), params.enc_kernel)?;
            if params.enc_kernel {
                let key = bldr.effective_kernel_key(&params)?;
                let data_key = bldr.kernel_data_key();
                k.decrypt(&mut data, key.as_ref(), data_key.as_ref())?;
            }
            match k.decompress(&data) {
                Ok(size) => info!("kernel image: {:#X} bytes uncompressed", size),
                Err(e) => warn!("{}", e),
            }
            kernel = Some(k);
        } else {
            warn!("2BL is invalid; kernel left untouched");
            status = LoadStatus::InvalidBldr;
        }

        if params.restore_boot_params
            && bldr.encryption_state() == EncryptionState::Plaintext
        {
            let region = data
                .try_get_mut(layout.boot_params_off..layout.boot_params_off + raw::BootParams::SIZE)?;
            for byte in region.iter_mut() {
                *byte = 0;
            }
        }

        Ok(Self {
            data: NoDebug(data),
            layout,
            status,
            init_tbl,
            preldr,
            bldr,
            kernel,
            params,
        })
    }

    /// Builds a BIOS of `binsize` bytes from the supplied components.
    ///
    /// The returned handle owns the finished image ([`data`] yields the
    /// load-ready bytes) with the entities decoded from the plaintext
    /// assembly stage, so the boot params and keys are inspectable even
    /// though the buffer itself ends up encrypted. When `params.romsize`
    /// exceeds `binsize` the image is tiled up to it as the final step.
    ///
    /// [`data`]: #method.data
    pub fn build(
        build_params: &BuildParams,
        binsize: u32,
        params: LoadParams,
    ) -> Result<Self, Error> {
        let layout = Layout::resolve(binsize)?;
        let mut data = build::assemble(build_params, binsize, &params)?;

        let init_tbl = raw::InitTbl::parse(&mut &data[..])?;

        // Decode the entities while everything is still plaintext. The
        // preldr is inspected without a secret boot key; nothing is
        // decrypted by it.
        let preldr = Preldr::decode(&mut data, &layout, None)?;
        let plain = LoadParams {
            enc_bldr: false,
            enc_kernel: false,
            ..params.clone()
        };
        let mut bldr = Bldr::decode(&mut data, &layout, &plain, false)?;

        let mut status = LoadStatus::Success;
        let mut kernel = None;
        if bldr.is_valid() {
            kernel = Some(Kernel::resolve(&layout, bldr.boot_params(), false)?);
        } else {
            // Expected when building with NO_BOOT_PARAMS or HACK_SIGNATURE.
            info!("built image carries an invalid 2BL");
            status = LoadStatus::InvalidBldr;
        }

        build::finalize(&mut data, &layout, build_params, &params)?;
        if params.enc_bldr {
            bldr.mark_ciphertext();
        }
        if params.enc_kernel {
            if let Some(kernel) = kernel.as_mut() {
                kernel.mark_ciphertext();
            }
        }

        let layout = Layout::resolve(data.len() as u32)?;
        Ok(Self {
            data: NoDebug(data),
            layout,
            status,
            init_tbl,
            preldr,
            bldr,
            kernel,
            params,
        })
    }

    /// Unloads the BIOS: zeroes all key material and the image buffer.
    ///
    /// Runs on drop as well; calling it twice is fine.
    pub fn unload(&mut self) {
        self.preldr.zeroize();
        self.bldr.zeroize();
        if let Some(kernel) = self.kernel.as_mut() {
            kernel.zeroize();
        }
        if let Some(key) = self.params.bldr_key.as_mut() {
            *key = Key([0; 16]);
        }
        if let Some(key) = self.params.kernel_key.as_mut() {
            *key = Key([0; 16]);
        }
        if let Some(mcpx) = self.params.mcpx.as_mut() {
            mcpx.zeroize();
        }
        for byte in self.data.0.iter_mut() {
            *byte = 0;
        }
        self.data.0.clear();
        self.data.0.shrink_to_fit();
    }

    /// Overall load status. Soft failures land here, hard failures never
    /// produce a handle.
    pub fn status(&self) -> LoadStatus {
        self.status
    }

    /// The raw image bytes, replicated to the full logical window.
    pub fn data(&self) -> &[u8] {
        &self.data.0
    }

    /// Size of the logical image in bytes.
    pub fn size(&self) -> u32 {
        self.layout.romsize
    }

    /// The resolved region offsets.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// The load parameters this image was decoded with.
    pub fn params(&self) -> &LoadParams {
        &self.params
    }

    /// The init table at the bottom of the image.
    pub fn init_tbl(&self) -> &raw::InitTbl {
        &self.init_tbl
    }

    /// The decoded preldr.
    pub fn preldr(&self) -> &Preldr {
        &self.preldr
    }

    /// The decoded 2BL.
    pub fn bldr(&self) -> &Bldr {
        &self.bldr
    }

    /// The kernel, present once the 2BL validated.
    pub fn kernel(&self) -> Option<&Kernel> {
        self.kernel.as_ref()
    }

    /// The 256-byte ROM digest region at the top of the preldr block.
    pub fn rom_digest(&self) -> &[u8] {
        self.region(self.layout.rom_digest_off, ROM_DIGEST_SIZE)
    }

    /// The 2BL block bytes in their current (en/decrypted) state.
    pub fn bldr_bytes(&self) -> &[u8] {
        self.region(self.layout.bldr_off, BLDR_BLOCK_SIZE)
    }

    /// The preldr block bytes.
    pub fn preldr_bytes(&self) -> &[u8] {
        self.region(self.layout.preldr_off, PRELDR_BLOCK_SIZE)
    }

    /// The init table bytes, sized by the 2BL's boot params.
    pub fn init_tbl_bytes(&self) -> &[u8] {
        self.region(self.layout.inittbl_off, self.bldr.boot_params().inittbl_size)
    }

    /// The compressed kernel bytes in their current state.
    pub fn kernel_bytes(&self) -> Option<&[u8]> {
        let kernel = self.kernel.as_ref()?;
        Some(self.region(kernel.krnl_off(), kernel.krnl_size()))
    }

    /// The kernel data section bytes in their current state.
    pub fn kernel_data_bytes(&self) -> Option<&[u8]> {
        let kernel = self.kernel.as_ref()?;
        Some(self.region(kernel.data_off(), kernel.data_size()))
    }

    /// Bytes left unclaimed between the init table and the kernel data
    /// section, negative when the declared sizes overlap.
    pub fn available_space(&self) -> i64 {
        let params = self.bldr.boot_params();
        i64::from(self.layout.romsize)
            - i64::from(MCPX_BLOCK_SIZE)
            - i64::from(PRELDR_BLOCK_SIZE)
            - i64::from(BLDR_BLOCK_SIZE)
            - i64::from(params.krnl_size)
            - i64::from(params.krnl_data_size)
            - i64::from(params.inittbl_size)
    }

    fn region(&self, off: u32, size: u32) -> &[u8] {
        let end = match off.checked_add(size) {
            Some(end) => end as usize,
            None => return &[],
        };
        self.data.0.get(off as usize..end).unwrap_or(&[])
    }
}

impl Drop for Bios {
    fn drop(&mut self) {
        self.unload();
    }
}
