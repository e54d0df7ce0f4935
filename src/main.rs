use anyhow::{bail, Result};
use clap::Parser;

use magiskd::cli::Cli;
use magiskd::stages;

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    #[cfg(target_os = "android")]
    {
        android_logger::init_once(
            android_logger::Config::default()
                .with_max_level(level)
                .with_tag("magiskd"),
        );
    }

    #[cfg(not(target_os = "android"))]
    {
        use std::io::Write;

        let mut builder = env_logger::Builder::new();
        builder.format(|buf, record| {
            writeln!(buf, "[{}] [{}] {}", record.level(), record.target(), record.args())
        });
        builder.filter_level(level).init();
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.startup {
        stages::startup()
    } else if cli.post_fs_data {
        stages::post_fs_data(cli.client_fd)
    } else if cli.service {
        stages::late_start(cli.client_fd);
        Ok(())
    } else if cli.boot_complete {
        stages::boot_complete(cli.client_fd);
        Ok(())
    } else {
        bail!("no boot stage requested")
    }
}

fn main() {
    if let Err(e) = run() {
        log::error!("Fatal Error: {e:#}");
        eprintln!("Fatal Error: {e:#}");
        std::process::exit(1);
    }
}
