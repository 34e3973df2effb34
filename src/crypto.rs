//! Composition of the external crypto primitives.
//!
//! The primitives themselves (RC4, SHA-1) come from crates and are assumed
//! correct; this module only wires them to the key sizes and chaining order
//! the BIOS format uses.

use crate::error::Error;

use rc4::consts::{U16, U20};
use rc4::{Key, KeyInit, Rc4, StreamCipher};
use sha1::{Digest, Sha1};

/// The fixed mask XORed byte-wise across the modulus of the public key
/// embedded in the preldr code.
pub(crate) const PUBLIC_KEY_MASK: [u8; 16] = [
    0x9A, 0x34, 0xC7, 0x51, 0x0E, 0xBD, 0x68, 0xF2, 0x2D, 0x83, 0x4F, 0xE6, 0x71, 0x1C, 0xA8, 0x5B,
];

/// ASN.1 DigestInfo prefix for SHA-1, used in the PKCS#1 v1.5 block of the
/// ROM digest region.
const SHA1_ASN1_PREFIX: [u8; 15] = [
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];

/// Applies the RC4 stream cipher over `data` in place.
///
/// Encryption and decryption are the same operation. The format only ever
/// uses 16-byte stored keys and 20-byte derived keys.
pub fn rc4_apply(key: &[u8], data: &mut [u8]) -> Result<(), Error> {
    match key.len() {
        16 => {
            Rc4::<U16>::new(Key::<U16>::from_slice(key)).apply_keystream(data);
            Ok(())
        }
        20 => {
            Rc4::<U20>::new(Key::<U20>::from_slice(key)).apply_keystream(data);
            Ok(())
        }
        n => Err(Error::Malformed(format!("unsupported RC4 key length {}", n))),
    }
}

/// SHA-1 over a sequence of byte slices, hashed as one message.
pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Derives the 20-byte bldr key from the MCPX secret boot key and the
/// preldr nonce.
///
/// The chain is `sha1(sha1(sbkey ‖ nonce) ‖ nonce)`; both the ordering and
/// the nonce re-mix are part of the contract.
pub fn derive_bldr_key(sbkey: &[u8; 16], nonce: &[u8; 16]) -> [u8; 20] {
    let intermediate = sha1(&[&sbkey[..], &nonce[..]]);
    sha1(&[&intermediate[..], &nonce[..]])
}

/// XORs the fixed public-key mask across `modulus`, recovering (or
/// re-obfuscating) it.
pub(crate) fn mask_modulus(modulus: &mut [u8]) {
    for (i, byte) in modulus.iter_mut().enumerate() {
        *byte ^= PUBLIC_KEY_MASK[i % PUBLIC_KEY_MASK.len()];
    }
}

/// Builds the 256-byte ROM digest block over a plaintext 2BL.
///
/// The block is a PKCS#1 v1.5 style encoding: `00 01 FF.. 00`, the ASN.1
/// SHA-1 DigestInfo prefix, then the digest itself in the final 20 bytes.
pub(crate) fn rom_digest_block(bldr: &[u8]) -> [u8; 256] {
    let digest = sha1(&[bldr]);
    let mut block = [0xFF; 256];
    block[0] = 0x00;
    block[1] = 0x01;
    block[256 - 20 - SHA1_ASN1_PREFIX.len() - 1] = 0x00;
    block[256 - 20 - SHA1_ASN1_PREFIX.len()..256 - 20].copy_from_slice(&SHA1_ASN1_PREFIX);
    block[256 - 20..].copy_from_slice(&digest);
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rc4_is_an_involution() {
        let key = [0x42u8; 16];
        let original: Vec<u8> = (0..0x600).map(|i| (i % 251) as u8).collect();

        let mut data = original.clone();
        rc4_apply(&key, &mut data).unwrap();
        assert_ne!(data, original);
        rc4_apply(&key, &mut data).unwrap();
        assert_eq!(data, original);
    }

    #[test]
    fn rc4_rejects_odd_key_lengths() {
        let mut data = [0u8; 16];
        assert!(rc4_apply(&[0u8; 7], &mut data).is_err());
    }

    #[test]
    fn key_derivation_is_deterministic_and_20_bytes() {
        let sbkey = [0x11u8; 16];
        let nonce = [0x22u8; 16];

        let a = derive_bldr_key(&sbkey, &nonce);
        let b = derive_bldr_key(&sbkey, &nonce);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);

        // both inputs feed the result
        assert_ne!(a, derive_bldr_key(&[0x12u8; 16], &nonce));
        assert_ne!(a, derive_bldr_key(&sbkey, &[0x23u8; 16]));

        // the double-hash structure is the contract: a single hash of the
        // concatenation must not produce the same key
        assert_ne!(a, sha1(&[&sbkey[..], &nonce[..]]));
    }

    #[test]
    fn modulus_mask_round_trips() {
        let original: Vec<u8> = (0..264).map(|i| (i * 7) as u8).collect();
        let mut masked = original.clone();
        mask_modulus(&mut masked);
        assert_ne!(masked, original);
        mask_modulus(&mut masked);
        assert_eq!(masked, original);
    }

    #[test]
    fn rom_digest_block_carries_the_digest_in_the_tail() {
        let bldr = vec![0x77u8; 0x6000];
        let block = rom_digest_block(&bldr);
        assert_eq!(block[0], 0x00);
        assert_eq!(block[1], 0x01);
        assert_eq!(&block[236..], &sha1(&[&bldr[..]])[..]);
    }
}
