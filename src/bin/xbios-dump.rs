//! Dumps information about a BIOS image: statuses, boot parameters, keys
//! and region offsets.

extern crate env_logger;
extern crate xbios;

#[allow(unused_imports)]
#[macro_use]
extern crate structopt;

use structopt::StructOpt;
use xbios::{Bios, Key, LoadParams, LoadStatus, Mcpx, McpxRevision};

use std::error::Error;
use std::fs::read;
use std::path::PathBuf;
use std::process;

#[derive(Debug, StructOpt)]
#[structopt(name = "xbios-dump", about = "Dump info from an Xbox BIOS image to stdout.")]
struct Opts {
    /// Path to the BIOS image.
    #[structopt(parse(from_os_str))]
    bios: PathBuf,
    /// Path to an MCPX ROM dump (512 bytes), used to derive the 2BL key
    /// when a preldr is present.
    #[structopt(long, parse(from_os_str))]
    mcpx: Option<PathBuf>,
    /// Treat the MCPX ROM as revision 1.0 (no preldr expected).
    #[structopt(long)]
    mcpx_v1_0: bool,
    /// 16-byte 2BL key, as 32 hex digits or a path to a key file.
    #[structopt(long)]
    bldr_key: Option<String>,
    /// 16-byte kernel key, as 32 hex digits or a path to a key file.
    #[structopt(long)]
    kernel_key: Option<String>,
    /// Logical rom size in bytes; defaults to the file size.
    #[structopt(long, default_value = "0")]
    romsize: u32,
    /// The 2BL in the image is not encrypted.
    #[structopt(long)]
    no_enc_bldr: bool,
    /// The kernel in the image is not encrypted.
    #[structopt(long)]
    no_enc_kernel: bool,
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

fn load_params(opts: &Opts) -> Result<LoadParams, Box<dyn Error>> {
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

    Ok(LoadParams {
        romsize: opts.romsize,
        bldr_key: opts.bldr_key.as_deref().map(read_key).transpose()?,
        kernel_key: opts.kernel_key.as_deref().map(read_key).transpose()?,
        mcpx,
        enc_bldr: !opts.no_enc_bldr,
        enc_kernel: !opts.no_enc_kernel,
        restore_boot_params: false,
    })
}

fn dump(bios: &Bios) {
    let layout = bios.layout();
    println!("image size:     {:#X}", bios.size());
    println!("preldr block:   {:#X}", layout.preldr_off);
    println!("2BL block:      {:#X}", layout.bldr_off);
    println!("MCPX window:    {:#X}", layout.mcpx_off);
    println!();

    println!("preldr status:  {:?}", bios.preldr().status());
    if let Some(params) = bios.preldr().params() {
        println!("  jmp offset:   {:#X}", params.jmp_offset);
    }
    if let Some(key) = bios.preldr().public_key() {
        println!("  public key:   RSA-{} e={:#X}", key.bits(), key.exponent());
    }
    if let Some(ptr) = bios.preldr().ptr_block() {
        println!("  entry:        {:#010X}", ptr.entry_addr);
        if ptr.entry_addr == xbios::PRELDR_TEA_ATTACK_ENTRY_POINT {
            println!("  entry point matches the TEA attack entry point");
        }
    }
    println!();

    let boot_params = bios.bldr().boot_params();
    println!("2BL state:      {:?}", bios.bldr().encryption_state());
    println!("boot signature: {:#X}", boot_params.signature);
    println!("kernel size:    {:#X}", boot_params.krnl_size);
    println!("kernel data:    {:#X}", boot_params.krnl_data_size);
    println!("init tbl size:  {:#X}", boot_params.inittbl_size);
    println!("kernel key:     {}", if boot_params.krnl_key_addr & xbios::KD_DELAY_FLAG != 0 {
        "external (KD_DELAY_FLAG)"
    } else {
        "in-image"
    });
    if let Some(keys) = bios.bldr().keys() {
        println!("keys:           {:?}", keys);
    }
    if let Some(bfm) = bios.bldr().bfm_key() {
        println!("bfm key:        {:?}", Key(*bfm));
    }
    println!();

    println!("init tbl ident: {:#X}", bios.init_tbl().init_tbl_identifier);
    println!("init tbl rev:   {:#X}", bios.init_tbl().revision);
    println!("avail space:    {:#X}", bios.available_space());

    if let Some(kernel) = bios.kernel() {
        match kernel.img_size() {
            Some(size) => println!("kernel image:   {:#X} bytes uncompressed", size),
            None => println!("kernel image:   not decompressed"),
        }
    }
}

fn run(opts: &Opts) -> Result<LoadStatus, Box<dyn Error>> {
    let data = read(&opts.bios)?;
    let bios = Bios::load(data, load_params(opts)?)?;
    dump(&bios);
    Ok(bios.status())
}

fn main() {
    env_logger::init();
    let opts = Opts::from_args();

    match run(&opts) {
        Ok(LoadStatus::Success) => {}
        Ok(LoadStatus::InvalidBldr) => {
            eprintln!("warning: the 2BL did not validate; dump may be garbage");
            process::exit(2);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}
