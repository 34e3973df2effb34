//! The 2BL (second-stage boot loader) decoder.
//!
//! The 2BL block carries the kernel keys, the boot parameters that locate
//! the compressed kernel, and the entry descriptor. On disk it is normally
//! RC4-encrypted, either under the preldr-derived key or under a key the
//! caller supplies.

use crate::crypto;
use crate::error::Error;
use crate::layout::Layout;
use crate::raw;
use crate::utils::{Key, SliceExt};
use crate::{
    EncryptionState, LoadParams, BLDR_BLOCK_SIZE, BOOT_SIGNATURE, KD_DELAY_FLAG, MCPX_BLOCK_SIZE,
    PRELDR_BLOCK_SIZE,
};

/// A decoded 2BL.
#[derive(Debug)]
pub struct Bldr {
    ldr_params: raw::BootLdrParam,
    boot_params: raw::BootParams,
    entry: Option<raw::BldrEntry>,
    keys: Option<raw::BldrKeys>,
    bfm_key: Option<Key>,
    encryption_state: EncryptionState,
    valid: bool,
}

impl Bldr {
    /// Decrypts (if necessary) and decodes the 2BL block.
    ///
    /// An invalid 2BL is a soft condition: the suspicious boot params stay
    /// exposed so downstream tools can diagnose them, and only the derived
    /// views (entry, keys, kernel) are withheld.
    pub(crate) fn decode(
        data: &mut [u8],
        layout: &Layout,
        params: &LoadParams,
        preldr_decrypted: bool,
    ) -> Result<Self, Error> {
        let mut encryption_state = if preldr_decrypted || !params.enc_bldr {
            EncryptionState::Plaintext
        } else {
            EncryptionState::Ciphertext
        };

        if encryption_state == EncryptionState::Ciphertext {
            match &params.bldr_key {
                Some(key) => {
                    let block =
                        data.try_get_mut(layout.bldr_off..layout.bldr_off + BLDR_BLOCK_SIZE)?;
                    crypto::rc4_apply(&key.0, block)?;
                    encryption_state = EncryptionState::Plaintext;
                }
                None => {
                    warn!("no bldr key supplied; 2BL left encrypted");
                }
            }
        }

        let mut head = data.try_get(layout.bldr_off..layout.bldr_off + raw::BootLdrParam::SIZE)?;
        let ldr_params = raw::BootLdrParam::parse(&mut head)?;

        let mut tail =
            data.try_get(layout.boot_params_off..layout.boot_params_off + raw::BootParams::SIZE)?;
        let boot_params = raw::BootParams::parse(&mut tail)?;

        let valid = validate_boot_params(&boot_params, layout);

        let mut bldr = Self {
            ldr_params,
            boot_params,
            entry: None,
            keys: None,
            bfm_key: None,
            encryption_state,
            valid,
        };

        if bldr.valid && bldr.encryption_state == EncryptionState::Plaintext {
            bldr.resolve_views(data, layout)?;
        }

        Ok(bldr)
    }

    /// Resolves the entry descriptor, key block and boot-from-media key.
    ///
    /// Only called once the boot params validated; a signature-carrying 2BL
    /// with pointers outside its own block is a hard error.
    fn resolve_views(&mut self, data: &[u8], layout: &Layout) -> Result<(), Error> {
        let entry_off = layout.bldr_entry_off;
        let mut slice = data.try_get(entry_off..entry_off + raw::BldrEntry::SIZE)?;
        let entry = raw::BldrEntry::parse(&mut slice)?;

        let keys_off = layout.bldr_addr_to_off(entry.keys_addr, raw::BldrKeys::SIZE)?;
        let mut slice = data.try_get(keys_off..keys_off + raw::BldrKeys::SIZE)?;
        self.keys = Some(raw::BldrKeys::parse(&mut slice)?);

        if entry.bfm_key_addr != 0 {
            let bfm_off = layout.bldr_addr_to_off(entry.bfm_key_addr, 16)?;
            let slice = data.try_get(bfm_off..bfm_off + 16)?;
            let mut key = [0; 16];
            key.copy_from_slice(slice);
            self.bfm_key = Some(Key(key));
        }

        self.entry = Some(entry);
        Ok(())
    }

    /// Picks the key the kernel is encrypted under.
    ///
    /// `KD_DELAY_FLAG` routes to the externally supplied key; otherwise the
    /// in-image key block is used. An all-zero key means the kernel is
    /// stored plaintext and `None` is returned.
    pub(crate) fn effective_kernel_key(
        &self,
        params: &LoadParams,
    ) -> Result<Option<[u8; 16]>, Error> {
        let key = if self.boot_params.krnl_key_addr & KD_DELAY_FLAG != 0 {
            match &params.kernel_key {
                Some(key) => key.0,
                None => return Err(Error::KeyMissing("kernel key (KD_DELAY_FLAG is set)")),
            }
        } else {
            match &self.keys {
                Some(keys) => keys.krnl_key,
                None => return Ok(None),
            }
        };

        if key == [0; 16] {
            Ok(None)
        } else {
            Ok(Some(key))
        }
    }

    /// The kernel data section key, or `None` when it is zero (plaintext
    /// data section).
    pub(crate) fn kernel_data_key(&self) -> Option<[u8; 16]> {
        let keys = self.keys.as_ref()?;
        if keys.krnl_data_key == [0; 16] {
            None
        } else {
            Some(keys.krnl_data_key)
        }
    }

    /// The boot parameters, exposed even when they failed validation.
    pub fn boot_params(&self) -> &raw::BootParams {
        &self.boot_params
    }

    pub fn ldr_params(&self) -> &raw::BootLdrParam {
        &self.ldr_params
    }

    pub fn entry(&self) -> Option<&raw::BldrEntry> {
        self.entry.as_ref()
    }

    pub fn keys(&self) -> Option<&raw::BldrKeys> {
        self.keys.as_ref()
    }

    /// The boot-from-media key, when the entry descriptor names one.
    pub fn bfm_key(&self) -> Option<&[u8; 16]> {
        self.bfm_key.as_ref().map(|k| &k.0)
    }

    pub fn encryption_state(&self) -> EncryptionState {
        self.encryption_state
    }

    /// Whether the boot parameters passed structural validation.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Records that the builder encrypted the 2BL region after this entity
    /// was decoded. Only the build direction moves the state this way.
    pub(crate) fn mark_ciphertext(&mut self) {
        self.encryption_state = EncryptionState::Ciphertext;
    }

    pub(crate) fn zeroize(&mut self) {
        if let Some(keys) = self.keys.as_mut() {
            *keys = raw::BldrKeys {
                eeprom_key: [0; 16],
                cert_key: [0; 16],
                krnl_key: [0; 16],
                krnl_data_key: [0; 16],
            };
        }
        if let Some(key) = self.bfm_key.as_mut() {
            *key = Key([0; 16]);
        }
    }
}

/// Validates the 2BL boot parameter sizes and the declared rom size.
///
/// Failures are logged individually; the caller downgrades them to the
/// `InvalidBldr` status.
fn validate_boot_params(boot_params: &raw::BootParams, layout: &Layout) -> bool {
    if boot_params.signature != BOOT_SIGNATURE {
        warn!(
            "2BL boot signature mismatch (got {:#X}, expected {:#X})",
            boot_params.signature, BOOT_SIGNATURE
        );
        return false;
    }
    if boot_params.krnl_size == 0 {
        warn!("2BL declares a zero-size kernel");
        return false;
    }
    if boot_params.krnl_data_size == 0 {
        warn!("2BL declares a zero-size kernel data section");
        return false;
    }

    let reserved_tail = BLDR_BLOCK_SIZE + PRELDR_BLOCK_SIZE + MCPX_BLOCK_SIZE;
    let total = boot_params
        .krnl_size
        .checked_add(boot_params.krnl_data_size);
    match total {
        Some(total) if total <= layout.romsize - reserved_tail => {}
        _ => {
            warn!(
                "kernel sizes ({:#X} + {:#X}) do not fit below the reserved tail",
                boot_params.krnl_size, boot_params.krnl_data_size
            );
            return false;
        }
    }

    if !crate::layout::check_size(layout.romsize) {
        warn!("declared rom size {:#X} is not an allowed size", layout.romsize);
        return false;
    }

    true
}
