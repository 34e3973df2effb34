//! Kernel decryption and decompression.
//!
//! The compressed kernel and its data section sit below the 2BL block and
//! are located through the 2BL's boot parameters. Each is encrypted under
//! its own RC4 key; the kernel itself is an LZX stream of self-describing
//! chunks.

use byteorder::{ReadBytesExt, LE};
use lzxd::{Lzxd, WindowSize};

use crate::error::Error;
use crate::layout::Layout;
use crate::raw::BootParams;
use crate::utils::{NoDebug, SliceExt};
use crate::{crypto, EncryptionState};

/// The kernel image and data section of a BIOS.
#[derive(Debug)]
pub struct Kernel {
    krnl_off: u32,
    krnl_size: u32,
    data_off: u32,
    data_size: u32,
    /// The decompressed kernel image, filled in lazily by [`decompress`].
    ///
    /// [`decompress`]: #method.decompress
    img: Option<NoDebug<Vec<u8>>>,
    encryption_state: EncryptionState,
}

impl Kernel {
    /// Locates the kernel regions from validated boot parameters.
    pub(crate) fn resolve(
        layout: &Layout,
        boot_params: &BootParams,
        encrypted: bool,
    ) -> Result<Self, Error> {
        let krnl_size = boot_params.krnl_size;
        let data_size = boot_params.krnl_data_size;
        Ok(Self {
            krnl_off: layout.krnl_off(krnl_size)?,
            krnl_size,
            data_off: layout.krnl_data_off(krnl_size, data_size)?,
            data_size,
            img: None,
            encryption_state: if encrypted {
                EncryptionState::Ciphertext
            } else {
                EncryptionState::Plaintext
            },
        })
    }

    /// Decrypts the compressed kernel and the kernel data section in place.
    ///
    /// `key` and `data_key` may be `None` when the respective region is
    /// stored plaintext (an all-zero key slot). Decrypting an entity that is
    /// already plaintext is refused with [`Error::AlreadyPlaintext`]; the
    /// state only ever moves towards plaintext.
    pub(crate) fn decrypt(
        &mut self,
        data: &mut [u8],
        key: Option<&[u8; 16]>,
        data_key: Option<&[u8; 16]>,
    ) -> Result<(), Error> {
        if self.encryption_state == EncryptionState::Plaintext {
            return Err(Error::AlreadyPlaintext);
        }

        if let Some(key) = key {
            let region = data.try_get_mut(self.krnl_off..self.krnl_off + self.krnl_size)?;
            crypto::rc4_apply(key, region)?;
        } else {
            debug!("kernel key slot is zero; compressed kernel treated as plaintext");
        }

        if let Some(key) = data_key {
            let region = data.try_get_mut(self.data_off..self.data_off + self.data_size)?;
            crypto::rc4_apply(key, region)?;
        } else {
            debug!("kernel data key slot is zero; data section treated as plaintext");
        }

        self.encryption_state = EncryptionState::Plaintext;
        Ok(())
    }

    /// Decompresses the plaintext kernel region and records the result.
    ///
    /// The region holds a sequence of LZX chunks, each prefixed with its
    /// compressed and uncompressed length; a zero compressed length ends the
    /// stream. Returns the uncompressed size.
    pub(crate) fn decompress(&mut self, data: &[u8]) -> Result<u32, Error> {
        let region = data.try_get(self.krnl_off..self.krnl_off + self.krnl_size)?;

        let mut lzxd = Lzxd::new(WindowSize::KB128);
        let mut out = Vec::new();
        let mut cursor = region;
        loop {
            let compressed_len = match cursor.read_u16::<LE>() {
                Ok(len) => len as usize,
                Err(_) => {
                    return Err(Error::DecompressFailed(
                        "truncated chunk header".to_string(),
                    ))
                }
            };
            if compressed_len == 0 {
                break;
            }
            let uncompressed_len = cursor
                .read_u16::<LE>()
                .map_err(|_| Error::DecompressFailed("truncated chunk header".to_string()))?
                as usize;
            if uncompressed_len == 0 {
                return Err(Error::DecompressFailed(
                    "chunk declares zero output length".to_string(),
                ));
            }
            if compressed_len > cursor.len() {
                return Err(Error::DecompressFailed(format!(
                    "chunk length {:#X} exceeds the kernel region",
                    compressed_len
                )));
            }

            let (chunk, rest) = cursor.split_at(compressed_len);
            cursor = rest;

            let decompressed = lzxd
                .decompress_next(chunk, uncompressed_len)
                .map_err(|e| Error::DecompressFailed(format!("{:?}", e)))?;
            out.extend_from_slice(decompressed);
        }

        let img_size = out.len() as u32;
        debug!(
            "kernel decompressed: {:#X} -> {:#X} bytes",
            self.krnl_size, img_size
        );
        self.img = Some(NoDebug(out));
        Ok(img_size)
    }

    /// The decompressed kernel image, once [`decompress`] succeeded.
    ///
    /// [`decompress`]: #method.decompress
    pub fn img(&self) -> Option<&[u8]> {
        self.img.as_ref().map(|img| &img.0[..])
    }

    /// Size of the decompressed kernel image in bytes.
    pub fn img_size(&self) -> Option<u32> {
        self.img.as_ref().map(|img| img.0.len() as u32)
    }

    /// Offset of the compressed kernel inside the image.
    pub fn krnl_off(&self) -> u32 {
        self.krnl_off
    }

    /// Size of the compressed kernel in bytes.
    pub fn krnl_size(&self) -> u32 {
        self.krnl_size
    }

    /// Offset of the kernel data section inside the image.
    pub fn data_off(&self) -> u32 {
        self.data_off
    }

    /// Size of the kernel data section in bytes.
    pub fn data_size(&self) -> u32 {
        self.data_size
    }

    pub fn encryption_state(&self) -> EncryptionState {
        self.encryption_state
    }

    /// Records that the builder encrypted the kernel regions after this
    /// entity was decoded. Only the build direction moves the state this
    /// way.
    pub(crate) fn mark_ciphertext(&mut self) {
        self.encryption_state = EncryptionState::Ciphertext;
    }

    pub(crate) fn zeroize(&mut self) {
        if let Some(img) = self.img.as_mut() {
            for byte in img.0.iter_mut() {
                *byte = 0;
            }
            img.0.clear();
        }
    }
}
