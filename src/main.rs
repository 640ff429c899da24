use anyhow::{bail, Context, Result};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use pzem_lib::{
    serialport::SerialTransport,
    session::{Pzem, State},
};
use serde_json::json;
use std::{ops::Deref, panic};

mod commandline;

use commandline::{CliArgs, CliCommands, OutputFormat};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn print_value(format: OutputFormat, name: &str, value: serde_json::Value) {
    match format {
        OutputFormat::Text => println!("{name}: {value}"),
        OutputFormat::Json => println!("{}", json!({ name: value })),
    }
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut transport = SerialTransport::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;
    transport.set_delay(args.delay);

    let mut pzem = Pzem::with_timeout(transport, args.address, args.timeout);
    if pzem.state() == State::Unresolved {
        bail!("No device found at address {}", args.address);
    }
    debug!("Device resolved at address {}", pzem.address());

    match args.command {
        CliCommands::Read => {
            let measurements = pzem
                .read()
                .with_context(|| "Cannot read measurements")?
                .clone();
            match args.format {
                OutputFormat::Text => {
                    println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                    println!("{measurements}");
                }
                OutputFormat::Json => println!(
                    "{}",
                    json!({
                        "timestamp": chrono::Utc::now().to_rfc3339(),
                        "address": pzem.address(),
                        "measurements": measurements,
                    })
                ),
            }
            debug!("Reading time: {:?}", pzem.reading_time());
        }
        CliCommands::Address => print_value(args.format, "address", json!(*pzem.address())),
        CliCommands::SetAddress { address } => {
            pzem.set_address(address)
                .with_context(|| format!("Cannot set address {address:#04X}"))?;
            print_value(args.format, "address", json!(*pzem.address()));
        }
        CliCommands::Threshold => {
            let watts = pzem
                .read_threshold()
                .with_context(|| "Cannot read threshold")?;
            print_value(args.format, "threshold", json!(watts));
        }
        CliCommands::SetThreshold { watts } => pzem
            .set_threshold(watts)
            .with_context(|| format!("Cannot set threshold {watts}W"))?,
        CliCommands::ResetEnergy => pzem
            .reset_energy()
            .with_context(|| "Cannot reset energy")?,
    }

    Ok(())
}
