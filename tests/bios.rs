//! End-to-end tests for the BIOS codec.
//!
//! Every image used here is produced by the builder itself, so the suite
//! exercises both directions at once: a scenario builds an image from known
//! components, loads the produced bytes back and checks that the decoded
//! fields match the inputs (modulo the mutations the build flags document).

use sha1::{Digest, Sha1};
use xbios::preldr::PreldrStatus;
use xbios::{
    Bios, BuildFlags, BuildParams, EncryptionState, Error, Key, LoadParams, LoadStatus, Mcpx,
    McpxRevision, BLDR_BASE, BOOT_SIGNATURE, KD_DELAY_FLAG, PRELDR_REAL_BASE,
};

const SBKEY: [u8; 16] = [0x5A; 16];
const BLDR_KEY: [u8; 16] = [0x77; 16];
const KRNL_KEY: [u8; 16] = [0x33; 16];
const KRNL_DATA_KEY: [u8; 16] = [0x44; 16];
const NONCE: [u8; 16] = [0xA7; 16];

/// Offset of the boot-params block inside the 2BL block.
const BOOT_PARAMS_OFF: usize = 0x6000 - 0x28;

fn put_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A plaintext 2BL with an entry descriptor, a key block and a zeroed
/// boot-params tail for the builder to patch.
fn make_bldr() -> Vec<u8> {
    let mut bldr = vec![0u8; 0x6000];
    for (i, byte) in bldr.iter_mut().enumerate().take(0x5000).skip(0x80) {
        *byte = (i % 251) as u8;
    }

    // loader params
    put_u32(&mut bldr, 0x00, 0x40);
    put_u32(&mut bldr, 0x04, 0);

    // entry descriptor
    put_u32(&mut bldr, 0x40, BLDR_BASE + 0x200); // keys
    put_u32(&mut bldr, 0x44, BLDR_BASE + 0x240); // bfm key slot
    put_u32(&mut bldr, 0x48, BLDR_BASE + 0x400); // entry point
    put_u32(&mut bldr, 0x4C, 0);

    // key block
    bldr[0x200..0x210].copy_from_slice(&[0x11; 16]); // eeprom
    bldr[0x210..0x220].copy_from_slice(&[0x22; 16]); // cert
    bldr[0x220..0x230].copy_from_slice(&KRNL_KEY);
    bldr[0x230..0x240].copy_from_slice(&KRNL_DATA_KEY);

    bldr
}

/// A preldr block: pointer and function blocks inside the code region, a
/// clear RSA header with an obfuscated modulus, and params carrying the
/// nonce.
fn make_preldr() -> Vec<u8> {
    let mut preldr = vec![0u8; 0x2A00];
    for (i, byte) in preldr.iter_mut().enumerate().take(0x2000).skip(0x700) {
        *byte = (i % 241) as u8;
    }

    // pointer block
    put_u32(&mut preldr, 0x400, PRELDR_REAL_BASE + 0x500); // public key
    put_u32(&mut preldr, 0x404, PRELDR_REAL_BASE + 0x40); // entry

    // public key: header in the clear, modulus bytes as stored (masked)
    preldr[0x500..0x504].copy_from_slice(b"RSA1");
    put_u32(&mut preldr, 0x504, 264);
    put_u32(&mut preldr, 0x508, 2048);
    put_u32(&mut preldr, 0x50C, 256);
    put_u32(&mut preldr, 0x510, 0x10001);

    // params
    put_u32(&mut preldr, 0x2880, 0x400);
    preldr[0x2890..0x28A0].copy_from_slice(&NONCE);

    preldr
}

fn make_inittbl() -> Vec<u8> {
    let mut tbl = vec![0u8; 0x200];
    for (i, byte) in tbl.iter_mut().enumerate().take(0x6C) {
        *byte = (i * 13) as u8;
    }
    tbl[0x6C..0x6E].copy_from_slice(&0x46u16.to_le_bytes()); // identifier
    tbl[0x6E..0x70].copy_from_slice(&0x107u16.to_le_bytes()); // revision
    for (i, byte) in tbl.iter_mut().enumerate().skip(0x80) {
        *byte = (i * 29) as u8;
    }
    tbl
}

/// A compressed kernel whose chunk stream terminates immediately, so it
/// decompresses (to nothing) without exercising the LZX bitstream.
fn make_kernel(size: usize) -> Vec<u8> {
    let mut kernel = vec![0u8; size];
    for (i, byte) in kernel.iter_mut().enumerate().skip(2) {
        *byte = (i % 239) as u8;
    }
    kernel[0] = 0;
    kernel[1] = 0;
    kernel
}

fn make_kernel_data() -> Vec<u8> {
    (0..0x300).map(|i| (i % 233) as u8).collect()
}

fn components(with_preldr: bool, flags: BuildFlags) -> BuildParams {
    BuildParams {
        init_tbl: make_inittbl(),
        preldr: if with_preldr { Some(make_preldr()) } else { None },
        bldr: make_bldr(),
        compressed_kernel: make_kernel(0x400),
        kernel_data: make_kernel_data(),
        eeprom_key: None,
        cert_key: None,
        flags,
    }
}

fn mcpx_v11() -> Mcpx {
    Mcpx::from_sbkey(McpxRevision::V1_1, SBKEY)
}

// S1: modern image, preldr present, MCPX v1.1 supplied. The preldr-derived
// key decrypts the 2BL.
#[test]
fn modern_image_decrypts_through_the_preldr() {
    let params = LoadParams {
        mcpx: Some(mcpx_v11()),
        ..LoadParams::default()
    };
    let built = Bios::build(
        &components(true, BuildFlags::FIX_2BL_DIGEST),
        0x100000,
        params.clone(),
    )
    .unwrap();
    let bytes = built.data().to_vec();
    assert_eq!(bytes.len(), 0x100000);

    // the 2BL on disk is ciphertext
    assert_ne!(&bytes[0xF7400..0xF7500], &make_bldr()[..0x100]);

    let bios = Bios::load(bytes, params).unwrap();
    assert_eq!(bios.status(), LoadStatus::Success);
    assert_eq!(bios.preldr().status(), PreldrStatus::BldrDecrypted);
    assert_eq!(bios.bldr().encryption_state(), EncryptionState::Plaintext);
    assert_eq!(bios.layout().preldr_off, 0xFD400);
    assert_eq!(bios.layout().bldr_off, 0xF7400);

    // derived key is exposed and matches the documented chain
    let expected = xbios::derive_bldr_key(&SBKEY, &NONCE);
    assert_eq!(bios.preldr().bldr_key(), Some(&expected));

    // the public key header survived recovery
    let key = bios.preldr().public_key().unwrap();
    assert_eq!(key.bits(), 2048);
    assert_eq!(key.exponent(), 0x10001);

    // components round-tripped
    assert_eq!(&bios.bldr_bytes()[..BOOT_PARAMS_OFF], &make_bldr()[..BOOT_PARAMS_OFF]);
    assert_eq!(bios.kernel_bytes().unwrap(), &make_kernel(0x400)[..]);
    assert_eq!(bios.kernel_data_bytes().unwrap(), &make_kernel_data()[..]);
    assert_eq!(bios.bldr().keys().unwrap().krnl_key, KRNL_KEY);

    let boot_params = bios.bldr().boot_params();
    assert_eq!(boot_params.signature, BOOT_SIGNATURE);
    assert_eq!(boot_params.krnl_size, 0x400);
    assert_eq!(boot_params.krnl_data_size, 0x300);
    assert_eq!(boot_params.inittbl_size, 0x200);

    // the empty chunk stream decompressed to an empty image
    assert_eq!(bios.kernel().unwrap().img(), Some(&[][..]));
}

// S2: legacy image, no preldr, MCPX v1.0; the 2BL decrypts directly with
// the supplied key.
#[test]
fn legacy_image_decrypts_with_the_supplied_key() {
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        mcpx: Some(Mcpx::from_sbkey(McpxRevision::V1_0, SBKEY)),
        ..LoadParams::default()
    };
    let built = Bios::build(&components(false, BuildFlags::empty()), 0x100000, params.clone())
        .unwrap();
    let bios = Bios::load(built.data().to_vec(), params).unwrap();

    assert_eq!(bios.status(), LoadStatus::Success);
    assert_eq!(bios.preldr().status(), PreldrStatus::NotFound);
    assert_eq!(bios.bldr().encryption_state(), EncryptionState::Plaintext);
    assert_eq!(&bios.bldr_bytes()[..BOOT_PARAMS_OFF], &make_bldr()[..BOOT_PARAMS_OFF]);
}

// S3: one flipped byte in the boot-params signature. The preldr re-encrypts
// and reports Found; the load degrades to InvalidBldr but stays
// inspectable.
#[test]
fn corrupted_signature_is_a_soft_failure() {
    let params = LoadParams {
        mcpx: Some(mcpx_v11()),
        ..LoadParams::default()
    };
    let built = Bios::build(&components(true, BuildFlags::empty()), 0x100000, params.clone())
        .unwrap();
    let mut bytes = built.data().to_vec();
    bytes[0xFD3D8 + 0x0C] ^= 0xFF; // signature word of the boot params

    let bios = Bios::load(bytes, params).unwrap();
    assert_eq!(bios.status(), LoadStatus::InvalidBldr);
    assert_eq!(bios.preldr().status(), PreldrStatus::Found);
    assert_eq!(bios.bldr().encryption_state(), EncryptionState::Ciphertext);
    assert!(bios.kernel().is_none());

    // still inspectable: boot params are exposed, garbage and all
    let _ = bios.bldr().boot_params().signature;
    assert!(!bios.bldr_bytes().is_empty());
}

// S4: a 300 KiB buffer is rejected outright.
#[test]
fn odd_sizes_are_rejected() {
    match Bios::load(vec![0u8; 300 * 1024], LoadParams::default()) {
        Err(Error::InvalidSize(size)) => assert_eq!(size, 300 * 1024),
        other => panic!("expected InvalidSize, got {:?}", other.map(|_| ())),
    }
}

// S5: build with encryption and a fresh ROM digest, load with the same
// keys, compare every component byte-for-byte.
#[test]
fn build_load_round_trip() {
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        ..LoadParams::default()
    };
    let built = Bios::build(
        &components(false, BuildFlags::FIX_2BL_DIGEST),
        0x100000,
        params.clone(),
    )
    .unwrap();
    let bytes = built.data().to_vec();

    let bios = Bios::load(bytes.clone(), params).unwrap();
    assert_eq!(bios.status(), LoadStatus::Success);

    // 2BL code region identical; boot params were patched by the builder
    assert_eq!(&bios.bldr_bytes()[..BOOT_PARAMS_OFF], &make_bldr()[..BOOT_PARAMS_OFF]);
    assert_eq!(bios.kernel_bytes().unwrap(), &make_kernel(0x400)[..]);
    assert_eq!(bios.kernel_data_bytes().unwrap(), &make_kernel_data()[..]);

    // init table identical except the checksum slot, and its words now sum
    // to zero
    let tbl = bios.init_tbl_bytes();
    let src = make_inittbl();
    assert_eq!(&tbl[..0x70], &src[..0x70]);
    assert_eq!(&tbl[0x74..], &src[0x74..]);
    let mut sum: u32 = 0;
    for word in tbl.chunks_exact(4) {
        sum = sum.wrapping_add(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
    }
    assert_eq!(sum, 0);

    // the ROM digest covers the plaintext 2BL
    let digest = sha1_of(bios.bldr_bytes());
    assert_eq!(&bios.rom_digest()[0x100 - 20..], &digest[..]);

    // a wrong 2BL key degrades to InvalidBldr instead of failing hard
    let wrong = LoadParams {
        bldr_key: Some(Key([0x78; 16])),
        ..LoadParams::default()
    };
    let bios = Bios::load(bytes, wrong).unwrap();
    assert_eq!(bios.status(), LoadStatus::InvalidBldr);
}

// S6: the kernel key is external (KD_DELAY_FLAG); a flipped key decrypts
// to garbage, decompression fails as a warning, the load still succeeds.
#[test]
fn wrong_kernel_key_only_loses_the_kernel_image() {
    let kernel_key = [0x66u8; 16];
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        kernel_key: Some(Key(kernel_key)),
        ..LoadParams::default()
    };
    let mut build_params = components(false, BuildFlags::ZERO_KERNEL_KEY);
    build_params.compressed_kernel = make_kernel(0x8);
    let built = Bios::build(&build_params, 0x100000, params.clone()).unwrap();
    let bytes = built.data().to_vec();

    // correct key: kernel round-trips and decompresses
    let bios = Bios::load(bytes.clone(), params.clone()).unwrap();
    assert_eq!(bios.status(), LoadStatus::Success);
    let boot_params = bios.bldr().boot_params();
    assert_ne!(boot_params.krnl_key_addr & KD_DELAY_FLAG, 0);
    assert_eq!(bios.bldr().keys().unwrap().krnl_key, [0; 16]);
    assert_eq!(bios.kernel_bytes().unwrap(), &make_kernel(0x8)[..]);
    assert_eq!(bios.kernel().unwrap().img(), Some(&[][..]));

    // flipped key: decrypt completes, decompression fails, load succeeds
    let mut wrong_key = kernel_key;
    wrong_key[0] ^= 0x01;
    let wrong = LoadParams {
        kernel_key: Some(Key(wrong_key)),
        ..params.clone()
    };
    let bios = Bios::load(bytes.clone(), wrong).unwrap();
    assert_eq!(bios.status(), LoadStatus::Success);
    assert!(bios.kernel().unwrap().img().is_none());
    assert_ne!(bios.kernel_bytes().unwrap(), &make_kernel(0x8)[..]);

    // no key at all is a hard error: the flag demands one
    let missing = LoadParams {
        kernel_key: None,
        ..params
    };
    match Bios::load(bytes, missing) {
        Err(Error::KeyMissing(_)) => {}
        other => panic!("expected KeyMissing, got {:?}", other.map(|_| ())),
    }
}

// Property 7: unload zeroes every derived or copied key.
#[test]
fn unload_zeroizes_key_material() {
    let params = LoadParams {
        mcpx: Some(mcpx_v11()),
        bldr_key: Some(Key(BLDR_KEY)),
        ..LoadParams::default()
    };
    let built = Bios::build(
        &components(true, BuildFlags::FIX_2BL_DIGEST),
        0x100000,
        params.clone(),
    )
    .unwrap();
    let mut bios = Bios::load(built.data().to_vec(), params).unwrap();
    assert_eq!(bios.preldr().bldr_key().map(|k| k != &[0; 20]), Some(true));

    bios.unload();
    assert!(bios.data().is_empty());
    assert_eq!(bios.preldr().bldr_key(), Some(&[0u8; 20]));
    let keys = bios.bldr().keys().unwrap();
    assert_eq!(keys.krnl_key, [0; 16]);
    assert_eq!(keys.krnl_data_key, [0; 16]);
    assert_eq!(keys.eeprom_key, [0; 16]);
    assert_eq!(bios.params().bldr_key, Some(Key([0; 16])));
}

// A 256 KiB build tiled up to the 1 MiB window loads like the full-size
// image.
#[test]
fn small_build_replicates_to_the_full_window() {
    let params = LoadParams {
        romsize: 0x100000,
        bldr_key: Some(Key(BLDR_KEY)),
        ..LoadParams::default()
    };
    let built = Bios::build(&components(false, BuildFlags::empty()), 0x40000, params.clone())
        .unwrap();
    let bytes = built.data().to_vec();
    assert_eq!(bytes.len(), 0x100000);
    // ciphertext tiles are identical before any decryption
    assert_eq!(&bytes[..0x40000], &bytes[0xC0000..]);

    let bios = Bios::load(bytes, params).unwrap();
    assert_eq!(bios.status(), LoadStatus::Success);
    assert_eq!(bios.layout().bldr_off, 0xF7400);
    assert_eq!(&bios.bldr_bytes()[..BOOT_PARAMS_OFF], &make_bldr()[..BOOT_PARAMS_OFF]);
    assert_eq!(bios.kernel_bytes().unwrap(), &make_kernel(0x400)[..]);
}

// restore_boot_params leaves a build-ready 2BL behind: the parsed copy
// stays on the entity, the buffer region is zeroed.
#[test]
fn restore_boot_params_zeroes_the_region() {
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        restore_boot_params: true,
        ..LoadParams::default()
    };
    let built = Bios::build(&components(false, BuildFlags::empty()), 0x100000, params.clone())
        .unwrap();
    let bios = Bios::load(built.data().to_vec(), params).unwrap();

    assert_eq!(bios.status(), LoadStatus::Success);
    assert_eq!(bios.bldr().boot_params().signature, BOOT_SIGNATURE);
    assert!(bios.bldr_bytes()[BOOT_PARAMS_OFF..].iter().all(|&b| b == 0));
}

// Build flag coverage: HACK_SIGNATURE and NO_BOOT_PARAMS leave the tail
// alone, HACK_INITTBL skips the checksum, BFM embeds the 2BL key.
#[test]
fn hack_flags_suppress_the_patches() {
    let plain = LoadParams {
        enc_bldr: false,
        enc_kernel: false,
        ..LoadParams::default()
    };

    // the supplied 2BL has a zeroed tail, so skipping the signature patch
    // leaves an invalid image behind
    let built = Bios::build(
        &components(false, BuildFlags::HACK_SIGNATURE),
        0x100000,
        plain.clone(),
    )
    .unwrap();
    assert_eq!(built.status(), LoadStatus::InvalidBldr);
    assert_eq!(built.bldr().boot_params().signature, 0);

    let built = Bios::build(
        &components(false, BuildFlags::NO_BOOT_PARAMS),
        0x100000,
        plain.clone(),
    )
    .unwrap();
    assert_eq!(built.status(), LoadStatus::InvalidBldr);
    assert!(built.bldr_bytes()[BOOT_PARAMS_OFF..].iter().all(|&b| b == 0));

    let built = Bios::build(
        &components(false, BuildFlags::HACK_INITTBL),
        0x100000,
        plain.clone(),
    )
    .unwrap();
    // checksum slot keeps the supplied bytes (zero in the fixture)
    assert_eq!(&built.data()[0x70..0x74], &[0u8; 4]);

    let bfm = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        ..plain
    };
    let built = Bios::build(&components(false, BuildFlags::BFM), 0x100000, bfm).unwrap();
    assert_eq!(built.bldr().bfm_key(), Some(&BLDR_KEY));
}

// Property 2, through the public API.
#[test]
fn key_derivation_is_pure() {
    let a = xbios::derive_bldr_key(&SBKEY, &NONCE);
    let b = xbios::derive_bldr_key(&SBKEY, &NONCE);
    assert_eq!(a, b);
    assert_ne!(a, xbios::derive_bldr_key(&SBKEY, &[0; 16]));
}

// A preldr whose jump offset points outside the code region is treated as
// absent.
#[test]
fn preldr_with_out_of_range_jump_is_not_found() {
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        mcpx: Some(mcpx_v11()),
        ..LoadParams::default()
    };
    let mut build_params = components(true, BuildFlags::empty());
    if let Some(preldr) = build_params.preldr.as_mut() {
        put_u32(preldr, 0x2880, 0x2880); // past the code region
    }
    let built = Bios::build(&build_params, 0x100000, params.clone()).unwrap();

    let bios = Bios::load(built.data().to_vec(), params).unwrap();
    assert_eq!(bios.preldr().status(), PreldrStatus::NotFound);
    // the 2BL still decrypts through the supplied key
    assert_eq!(bios.status(), LoadStatus::Success);
}

// A preldr with a broken public-key header reports an error without
// touching the 2BL.
#[test]
fn preldr_with_bad_public_key_reports_error() {
    let params = LoadParams {
        bldr_key: Some(Key(BLDR_KEY)),
        mcpx: Some(mcpx_v11()),
        ..LoadParams::default()
    };
    let mut build_params = components(true, BuildFlags::empty());
    if let Some(preldr) = build_params.preldr.as_mut() {
        preldr[0x500..0x504].copy_from_slice(b"RSA2");
    }
    let built = Bios::build(&build_params, 0x100000, params.clone()).unwrap();

    let bios = Bios::load(built.data().to_vec(), params).unwrap();
    assert_eq!(bios.preldr().status(), PreldrStatus::Error);
    assert_eq!(bios.status(), LoadStatus::Success);
}
