extern crate xbios;
#[macro_use] extern crate honggfuzz;

use xbios::{Bios, LoadParams};

fn main() {
    loop {
        fuzz!(|data: &[u8]| {
            Bios::load(data.to_vec(), LoadParams::default()).ok();
        });
    }
}
