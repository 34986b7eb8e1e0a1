#![allow(clippy::print_stdout)]

//! Seeks a DualSense controller and prints lifecycle events.
//!
//! Run with a vendor:product pair to watch something else:
//! `cargo run --example watch -- 046d c332`

use std::env;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use periseek::{ProductId, Result};
use periseek_hid::{HidHandle, HidSeeker};

fn target_from_args() -> Option<ProductId> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [] => Some(ProductId::new(0x054c, 0x0ce6)),
        [vendor, product] => {
            let vendor = u16::from_str_radix(vendor, 16).ok()?;
            let product = u16::from_str_radix(product, 16).ok()?;
            Some(ProductId::new(vendor, product))
        }
        _ => None,
    }
}

fn configure(seeker: &mut HidSeeker, target: ProductId) -> Result<()> {
    seeker.set_on_discover_device(Some(Box::new(|handle: &HidHandle| {
        let name = handle.peripheral.product_string.as_deref().unwrap_or("?");
        println!("connected: {name} ({:?})", handle.peripheral.path);
    })))?;
    seeker.set_on_forget_device(Some(Box::new(|handle: &HidHandle| {
        println!("disconnected: {:?}", handle.peripheral.path);
    })))?;
    seeker.set_on_block_peripheral(Some(Box::new(|blocked| {
        println!("quarantined: {:?} ({:?})", blocked.peripheral.path, blocked.cause);
    })))?;
    seeker.target_product(target)
}

fn main() -> ExitCode {
    let Some(target) = target_from_args() else {
        println!("usage: watch [<vendor-hex> <product-hex>]");
        return ExitCode::FAILURE;
    };

    let mut seeker = match periseek_hid::HidBackend::seeker() {
        Ok(seeker) => seeker,
        Err(error) => {
            println!("hidapi unavailable: {error}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(error) = configure(&mut seeker, target) {
        println!("setup failed: {error}");
        return ExitCode::FAILURE;
    }

    println!("seeking {target}, press ctrl-c to stop");
    loop {
        if let Err(error) = seeker.seek() {
            println!("seek failed: {error}");
            return ExitCode::FAILURE;
        }
        thread::sleep(Duration::from_millis(100));
    }
}
