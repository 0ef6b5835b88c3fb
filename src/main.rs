// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs an unmodified 8088-era BIOS on the platform hypervisor behind a
//! PC/XT chipset model.

use std::path::Path;
use std::path::PathBuf;

use argh::FromArgs;
use base::error;
use base::info;
use base::syslog;

mod vm;

use vm::Config;

#[derive(FromArgs)]
/// A PC/XT machine on the platform hypervisor.
struct CommandLine {
    /// raw floppy image for drive A
    #[argh(option)]
    floppy: Option<PathBuf>,

    /// conventional memory reported by the DIP switches, in KiB
    #[argh(option, default = "640")]
    ram_kib: u32,

    /// program image, BIOS image (recognized by a `.bin`/`.fw` suffix), or
    /// program followed by BIOS
    #[argh(positional)]
    image: Vec<PathBuf>,
}

fn is_bios_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("bin") || ext.eq_ignore_ascii_case("fw")
    )
}

fn config_from_args(args: CommandLine) -> Config {
    let mut program = None;
    let mut bios = PathBuf::from(vm::DEFAULT_BIOS);
    match args.image.as_slice() {
        [] => {}
        [only] => {
            if is_bios_file(only) {
                bios = only.clone();
            } else {
                program = Some(only.clone());
            }
        }
        [first, second, rest @ ..] => {
            program = Some(first.clone());
            bios = second.clone();
            if !rest.is_empty() {
                base::warn!("ignoring extra positional arguments");
            }
        }
    }
    Config {
        program,
        bios,
        floppy: args.floppy,
        ram_kib: args.ram_kib,
    }
}

fn main() {
    syslog::init();
    let cfg = config_from_args(argh::from_env());
    match vm::run_config(cfg) {
        Ok(()) => info!("xtvm has exited normally"),
        Err(e) => {
            error!("xtvm has exited with error: {:#}", e);
            std::process::exit(1);
        }
    }
}
