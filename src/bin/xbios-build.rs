//! Assembles a BIOS image from component files.

extern crate env_logger;
extern crate xbios;

#[allow(unused_imports)]
#[macro_use]
extern crate structopt;

use structopt::StructOpt;
use xbios::{Bios, BuildFlags, BuildParams, Key, LoadParams, Mcpx, McpxRevision};

use std::error::Error;
use std::fs::{read, write};
use std::path::PathBuf;
use std::process;

const DEFAULT_OUTPUT_EXTENSION: &str = "bin";

#[derive(Debug, StructOpt)]
#[structopt(
    name = "xbios-build",
    about = "Assemble a BIOS image from an init table, a 2BL, a preldr and a compressed kernel."
)]
struct Opts {
    /// Init table blob.
    #[structopt(long, parse(from_os_str))]
    inittbl: PathBuf,
    /// Plaintext 2BL blob (at most 0x6000 bytes).
    #[structopt(long, parse(from_os_str))]
    bldr: PathBuf,
    /// Preldr blob (code + params, at most 0x2A00 bytes).
    #[structopt(long, parse(from_os_str))]
    preldr: Option<PathBuf>,
    /// Compressed kernel image.
    #[structopt(long, parse(from_os_str))]
    krnl: PathBuf,
    /// Kernel data section.
    #[structopt(long, parse(from_os_str))]
    krnldata: PathBuf,
    /// Replacement EEPROM key (32 hex digits or a key file).
    #[structopt(long)]
    eeprom_key: Option<String>,
    /// Replacement certificate key (32 hex digits or a key file).
    #[structopt(long)]
    cert_key: Option<String>,
    /// 16-byte 2BL key used to encrypt the 2BL (and embedded by --bfm).
    #[structopt(long)]
    bldr_key: Option<String>,
    /// External 16-byte kernel key, required with --zerokernelkey.
    #[structopt(long)]
    kernel_key: Option<String>,
    /// MCPX ROM dump; with a preldr present the 2BL is encrypted under the
    /// derived key instead of --bldr-key.
    #[structopt(long, parse(from_os_str))]
    mcpx: Option<PathBuf>,
    /// Treat the MCPX ROM as revision 1.0.
    #[structopt(long)]
    mcpx_v1_0: bool,

    /// Embed the boot-from-media key into the 2BL.
    #[structopt(long)]
    bfm: bool,
    /// Skip the init-table checksum fixup.
    #[structopt(long)]
    hackinittbl: bool,
    /// Leave the boot-params signature as supplied.
    #[structopt(long)]
    hacksignature: bool,
    /// Do not write the boot-params block.
    #[structopt(long)]
    nobootparams: bool,
    /// Zero the in-image kernel key.
    #[structopt(long)]
    zerokernelkey: bool,
    /// Recompute and embed the ROM digest of the 2BL.
    #[structopt(long)]
    fix2bldigest: bool,

    /// Physical image size in bytes.
    #[structopt(long, default_value = "1048576")]
    binsize: u32,
    /// Logical rom size; when larger than --binsize the image is tiled up
    /// to it.
    #[structopt(long, default_value = "0")]
    romsize: u32,
    /// Leave the 2BL unencrypted.
    #[structopt(long)]
    no_enc_bldr: bool,
    /// Leave the kernel unencrypted.
    #[structopt(long)]
    no_enc_kernel: bool,

    /// The output file. If not specified, output goes to a file next to the
    /// 2BL, with the extension changed to `.bin`.
    #[structopt(short = "o", long, parse(from_os_str))]
    output: Option<PathBuf>,
}

/// Parses a key argument: either 32 hex digits or a path to a 16-byte file.
fn read_key(arg: &str) -> Result<Key, Box<dyn Error>> {
    if arg.len() == 32 && arg.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut key = [0u8; 16];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&arg[i * 2..i * 2 + 2], 16)?;
        }
        return Ok(Key(key));
    }

    let bytes = read(arg)?;
    if bytes.len() != 16 {
        return Err(format!("key file {} is {} bytes, expected 16", arg, bytes.len()).into());
    }
    let mut key = [0u8; 16];
    key.copy_from_slice(&bytes);
    Ok(Key(key))
}

fn run(opts: &Opts) -> Result<(), Box<dyn Error>> {
    let mut flags = BuildFlags::empty();
    flags.set(BuildFlags::BFM, opts.bfm);
    flags.set(BuildFlags::HACK_INITTBL, opts.hackinittbl);
    flags.set(BuildFlags::HACK_SIGNATURE, opts.hacksignature);
    flags.set(BuildFlags::NO_BOOT_PARAMS, opts.nobootparams);
    flags.set(BuildFlags::ZERO_KERNEL_KEY, opts.zerokernelkey);
    flags.set(BuildFlags::FIX_2BL_DIGEST, opts.fix2bldigest);

    let build_params = BuildParams {
        init_tbl: read(&opts.inittbl)?,
        preldr: opts.preldr.as_ref().map(read).transpose()?,
        bldr: read(&opts.bldr)?,
        compressed_kernel: read(&opts.krnl)?,
        kernel_data: read(&opts.krnldata)?,
        eeprom_key: opts
            .eeprom_key
            .as_deref()
            .map(read_key)
            .transpose()?
            .map(|k| k.0),
        cert_key: opts
            .cert_key
            .as_deref()
            .map(read_key)
            .transpose()?
            .map(|k| k.0),
        flags,
    };

    let mcpx = match &opts.mcpx {
        Some(path) => {
            let rom = read(path)?;
            let revision = if opts.mcpx_v1_0 {
                McpxRevision::V1_0
            } else {
                McpxRevision::V1_1
            };
            Some(Mcpx::from_rom(revision, &rom)?)
        }
        None => None,
    };

    let params = LoadParams {
        romsize: opts.romsize,
        bldr_key: opts.bldr_key.as_deref().map(read_key).transpose()?,
        kernel_key: opts.kernel_key.as_deref().map(read_key).transpose()?,
        mcpx,
        enc_bldr: !opts.no_enc_bldr,
        enc_kernel: !opts.no_enc_kernel,
        restore_boot_params: false,
    };

    let bios = Bios::build(&build_params, opts.binsize, params)?;

    let out = opts
        .output
        .clone()
        .unwrap_or_else(|| opts.bldr.with_extension(DEFAULT_OUTPUT_EXTENSION));
    eprintln!("Writing {:#X} bytes to {}", bios.size(), out.display());
    write(&out, bios.data())?;
    Ok(())
}

fn main() {
    env_logger::init();
    let opts = Opts::from_args();

    if let Err(e) = run(&opts) {
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
