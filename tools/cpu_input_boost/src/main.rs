// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use cpu_input_boost::control::send_command;
use cpu_input_boost::{run, Opts};

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    // Client modes talk to a running daemon and print its reply.
    if let Some(request) = opts.client_request()? {
        let reply = send_command(&opts.control_socket, &request)?;
        println!("{}", reply);
        return Ok(());
    }

    let llv = match &opts.verbose {
        0 => simplelog::LevelFilter::Info,
        1 => simplelog::LevelFilter::Debug,
        _ => simplelog::LevelFilter::Trace,
    };

    let mut lcfg = simplelog::ConfigBuilder::new();
    let _ = lcfg.set_time_offset_to_local();
    simplelog::TermLogger::init(
        llv,
        lcfg.set_time_level(simplelog::LevelFilter::Error)
            .set_location_level(simplelog::LevelFilter::Off)
            .set_target_level(simplelog::LevelFilter::Off)
            .set_thread_level(simplelog::LevelFilter::Off)
            .build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    run(opts, shutdown)
}
