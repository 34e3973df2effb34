//! Raw structures that can be deserialized from binary data.
//!
//! Generally, the structures in here have a very loose structure in that they
//! don't try to verify their values if not necessary. They also store most
//! things as raw values instead of more convenient types. That's left to do
//! for the user-facing wrappers.
//!
//! This module also serves to document the basic memory layout of the BIOS
//! structures: All struct fields are parsed in-order and are deserialized
//! using `bincode` (no padding is used anywhere and the layout is mostly
//! "obvious"). Structures the builder writes back are serialized the same
//! way.
//!
//! Everything is Little Endian.

use crate::Error;
use serde::de;

use std::fmt;
use std::marker::PhantomData;

/// Deserializes a packed struct from the front of `data`, advancing it.
fn parse_from<T: de::DeserializeOwned>(data: &mut &[u8]) -> Result<T, Error> {
    ::bincode::deserialize_from(data).map_err(|e| Error::Malformed(format!("{:?}", e)))
}

/// Serializes a packed struct into `out`, which must be exactly as long as
/// the struct's on-disk representation.
fn write_into<T: serde::Serialize>(value: &T, out: &mut [u8]) -> Result<(), Error> {
    let bytes = ::bincode::serialize(value).map_err(|e| Error::Malformed(format!("{:?}", e)))?;
    if bytes.len() != out.len() {
        return Err(Error::Malformed(format!(
            "serialized struct is {} bytes, expected {}",
            bytes.len(),
            out.len()
        )));
    }
    out.copy_from_slice(&bytes);
    Ok(())
}

/// The 2BL boot parameter block, stored at the tail of the 2BL block.
///
/// Only meaningful once the 2BL is plaintext; the `signature` field then
/// anchors the whole decode (it must equal `BOOT_SIGNATURE`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootParams {
    /// Size of the compressed kernel image in bytes.
    pub krnl_size: u32,
    /// Size of the uncompressed kernel data section in bytes.
    pub krnl_data_size: u32,
    /// Size of the init table in bytes.
    pub inittbl_size: u32,
    /// Must equal `BOOT_SIGNATURE` ("JyTx") after decryption.
    pub signature: u32,
    /// `BLDR_BASE`-relative address of the in-image kernel key.
    ///
    /// Bit 31 is `KD_DELAY_FLAG`: the kernel key is supplied externally and
    /// the in-image key field is ignored.
    pub krnl_key_addr: u32,
    /// SHA-1 digest over kernel data ‖ compressed kernel, checked by the 2BL
    /// at boot time.
    pub digest: [u8; 20],
}

impl BootParams {
    /// On-disk size in bytes.
    pub const SIZE: u32 = 0x28;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }

    pub fn write(&self, out: &mut [u8]) -> Result<(), Error> {
        write_into(self, out)
    }
}

/// The loader parameter words at the very start of the 2BL block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BootLdrParam {
    /// Offset of the 2BL entry stub, relative to the 2BL base.
    pub entry_offset: u32,
    /// Opaque parameter passed to the entry stub.
    pub param: u32,
}

impl BootLdrParam {
    pub const SIZE: u32 = 0x8;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The 2BL entry descriptor, at a fixed offset from the 2BL base.
///
/// Addresses in here are relative to the 2BL's boot base (`BLDR_BASE`), not
/// to the image.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BldrEntry {
    /// `BLDR_BASE`-relative address of the `BldrKeys` struct.
    pub keys_addr: u32,
    /// `BLDR_BASE`-relative address of the boot-from-media key, or 0 if the
    /// 2BL carries none.
    pub bfm_key_addr: u32,
    /// `BLDR_BASE`-relative address of the 2BL entry point.
    pub entry_point: u32,
    pub reserved: u32,
}

impl BldrEntry {
    pub const SIZE: u32 = 0x10;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The key block embedded in the 2BL.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BldrKeys {
    pub eeprom_key: [u8; 16],
    pub cert_key: [u8; 16],
    pub krnl_key: [u8; 16],
    pub krnl_data_key: [u8; 16],
}

impl BldrKeys {
    pub const SIZE: u32 = 0x40;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The preldr parameter struct, stored between the preldr code and the ROM
/// digest.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreldrParams {
    /// Offset of the pointer block inside the preldr code region.
    ///
    /// Zero means there is no preldr (old BIOS, or not a valid BIOS).
    pub jmp_offset: u32,
    pub reserved0: [u32; 3],
    /// Per-image nonce mixed into the bldr key derivation.
    pub nonce: [u8; 16],
    pub reserved1: [u32; 24],
}

impl PreldrParams {
    pub const SIZE: u32 = 0x80;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The preldr pointer block, located by `PreldrParams::jmp_offset`.
///
/// All addresses are absolute addresses in the CPU's top-of-memory map and
/// are converted to block offsets by subtracting `PRELDR_REAL_BASE`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreldrPtrBlock {
    /// Address of the embedded `XbPublicKey`.
    pub public_key_addr: u32,
    /// Address the preldr jumps to once the 2BL is decrypted and verified.
    pub entry_addr: u32,
    pub reserved: [u32; 2],
}

impl PreldrPtrBlock {
    pub const SIZE: u32 = 0x10;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The preldr function block, at the next 16-byte-aligned slot after the
/// pointer block.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PreldrFuncBlock {
    pub sha_update_addr: u32,
    pub sha_final_addr: u32,
    pub rc4_key_addr: u32,
    pub rc4_crypt_addr: u32,
}

impl PreldrFuncBlock {
    pub const SIZE: u32 = 0x10;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// Header of the public key embedded in the preldr code.
#[derive(Debug, Clone, Deserialize)]
pub struct RsaHeader {
    /// `"RSA1"`.
    pub magic: [u8; 4],
    /// Size of the modulus blob in bytes.
    pub mod_size: u32,
    /// Key size in bits; 2048 for all known preldrs.
    pub bits: u32,
    pub max_bytes: u32,
    /// Public exponent; 0x10001 for all known preldrs.
    pub exponent: u32,
}

impl RsaHeader {
    pub const SIZE: u32 = 0x14;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The public key embedded in the preldr code region.
///
/// The header is stored in the clear; the modulus is XOR-obfuscated with a
/// fixed repeating mask and recovered by the preldr decoder.
#[derive(Debug, Deserialize)]
pub struct XbPublicKey {
    pub header: RsaHeader,
    pub modulus: Modulus,
}

impl XbPublicKey {
    pub const SIZE: u32 = RsaHeader::SIZE + 264;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// The init table at the bottom of the image.
///
/// The hardware init words are opaque to the codec; only the identifier,
/// revision and checksum slots are interpreted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InitTbl {
    /// Hardware initialization words, consumed by the MCPX at reset.
    pub vals: [u32; 27],
    /// Identifies the kernel generation this table was produced for.
    pub init_tbl_identifier: u16,
    pub revision: u16,
    /// Makes the `u32` words of the init table region sum to zero.
    pub checksum: u32,
}

impl InitTbl {
    pub const SIZE: u32 = 0x74;
    /// Offset of the `checksum` field within the table.
    pub const CHECKSUM_OFFSET: u32 = 0x70;

    pub fn parse(data: &mut &[u8]) -> Result<Self, Error> {
        parse_from(data)
    }
}

/// A serde visitor that deserializes a fixed number of elements as a sequence
/// and passes them to a closure to be put into the final result type.
struct SliceAdapter<F, S: 'static, R>
where
    F: FnOnce(&[S]) -> R,
{
    /// Maps the decoded byte slice to the final result value of type `R`.
    ///
    /// The passed slice always has length `num_elements`.
    map: F,
    /// A string describing what kind of item was expected.
    expected: &'static str,
    /// Number of elements to decode from the stream.
    num_elements: usize,
    _phantom: PhantomData<&'static S>,
}

impl<F, S: 'static, R> SliceAdapter<F, S, R>
where
    F: FnOnce(&[S]) -> R,
{
    fn new(map: F, expected: &'static str, num_bytes: usize) -> Self {
        Self {
            map,
            expected,
            num_elements: num_bytes,
            _phantom: PhantomData,
        }
    }
}

impl<'de, F, S: 'static, R> de::Visitor<'de> for SliceAdapter<F, S, R>
where
    F: FnOnce(&[S]) -> R,
    S: de::Deserialize<'de>,
{
    type Value = R;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}", self.expected)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut buf = Vec::with_capacity(self.num_elements);
        while let Some(byte) = seq.next_element::<S>()? {
            buf.push(byte);
        }

        Ok((self.map)(&buf))
    }
}

/// This type exists solely because `[u8; 264]` doesn't implement the serde
/// traits (or `Debug`).
#[derive(Copy, Clone)]
pub struct Modulus(pub [u8; 264]);

impl fmt::Debug for Modulus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let slice: &[u8] = &self.0;
        write!(f, "0x")?;
        for b in slice {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl<'de> de::Deserialize<'de> for Modulus {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: de::Deserializer<'de>,
    {
        // we use tuple instead of seq or bytes here since we know the length
        deserializer.deserialize_tuple(
            264,
            SliceAdapter::new(
                |slice| {
                    let mut buf = [0; 264];
                    buf.copy_from_slice(slice);
                    Modulus(buf)
                },
                "modulus blob (264 Bytes)",
                264,
            ),
        )
    }
}
