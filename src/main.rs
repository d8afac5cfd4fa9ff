//! Modbus RTU Monitor CLI
//!
//! A command-line interface (CLI) application for passively watching a Modbus
//! RTU heating controller bus through a serial-to-TCP gateway.
//!
//! This tool allows users to:
//! - Print the state of every slave (temperature, humidity, setpoint, heating
//!   status, coils and named registers) whenever it changes.
//! - Write a new setpoint to one zone.
//! - Decode captured bus bytes offline.
//!
//! The CLI leverages the `rtu_monitor_lib` crate for re-framing, decoding and
//! the monitor runtime.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use rtu_monitor_lib::{
    protocol::{self as proto, Frame, Payload},
    reframer::Reframer,
    store::SlaveData,
    tokio_monitor::{Monitor, Snapshot},
};
use std::io::{stdout, Write};
use std::panic;
use std::time::Duration;
use tokio_modbus::Slave;

mod commandline;
mod config;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    log_handle
}

fn format_value<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| String::from("-"), |v| v.to_string())
}

fn format_coils(coils: &[bool]) -> String {
    let active: Vec<String> = coils
        .iter()
        .enumerate()
        .filter(|(_, on)| **on)
        .map(|(index, _)| (index + 1).to_string())
        .collect();
    if active.is_empty() {
        String::from("none")
    } else {
        active.join(",")
    }
}

fn print_slave(data: &SlaveData) {
    println!(
        "{:<5} {:>8} {:>8} {:>8} {:>7} {}",
        data.slave,
        format_value(data.temperature.map(|t| format!("{t:.1}"))),
        format_value(data.humidity.map(|h| format!("{h:.1}"))),
        format_value(data.setpoint().map(|s| format!("{s:.1}"))),
        format_value(data.heating_active().map(|on| if on { "on" } else { "off" })),
        if data.available { "available" } else { "unavailable" },
    );
    if let Some(coils) = &data.coils {
        println!("      coils on: {}", format_coils(coils));
    }
    if let Some(registers) = &data.registers {
        for (address, value) in registers {
            if let Some(name) = proto::register_name(*address) {
                println!("      {address:>3} {name:<20} {value}");
            }
        }
    }
}

fn print_table(snapshot: &Snapshot) {
    println!(
        "{:<5} {:>8} {:>8} {:>8} {:>7} Status",
        "Slave", "Temp °C", "Hum %", "Set °C", "Heating"
    );
    for data in snapshot.values() {
        print_slave(data);
    }
    println!();
}

fn print_yaml(snapshot: &Snapshot) -> Result<()> {
    let yaml = serde_yaml::to_string(&**snapshot).context("Cannot serialize slave state")?;
    println!("---\n{yaml}");
    Ok(())
}

fn describe_frame(frame: &Frame) -> String {
    let header = format!(
        "slave {:>3} fc 0x{:02X}",
        frame.slave,
        frame.function.value()
    );
    match &frame.payload {
        Payload::Request { address, quantity } => {
            let target = if *address == proto::DISCOVERY_REG_ADDR {
                String::from(" (discovery block)")
            } else {
                proto::register_name(*address)
                    .map(|name| format!(" ({name})"))
                    .unwrap_or_default()
            };
            format!("{header} request  address {address}{target}, quantity {quantity}")
        }
        Payload::Coils(coils) => format!(
            "{header} response {} coils, on: {}",
            coils.len(),
            format_coils(coils)
        ),
        Payload::Registers(values) => format!("{header} response registers {values:?}"),
        Payload::Unclassified => format!("{header} unclassified"),
    }
}

/// Handles the offline decode command.
fn handle_decode(bytes: &[u8]) -> Result<()> {
    info!("Executing: Decode {} bytes", bytes.len());
    let mut reframer = Reframer::new();
    let mut batch = reframer.push(bytes);
    let mut frames = std::mem::take(&mut batch.frames);
    let mut discarded = batch.discarded;
    while batch.exhausted {
        batch = reframer.process();
        frames.append(&mut batch.frames);
        discarded += batch.discarded;
    }

    for frame in &frames {
        println!("{}", describe_frame(frame));
    }
    println!("Frames: {}, discarded bytes: {discarded}", frames.len());
    if !reframer.is_empty() {
        println!("Incomplete trailing bytes: {}", reframer.len());
    }
    Ok(())
}

/// Handles the monitor command until Ctrl-C.
async fn handle_monitor(monitor: &Monitor, output: commandline::MonitorOutput) -> Result<()> {
    info!("Executing: Monitor, output={output:?}");
    let mut updates = monitor.subscribe();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Cannot listen for Ctrl-C")?;
                info!("Ctrl-C received, stopping monitor");
                break;
            }
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                match output {
                    commandline::MonitorOutput::Table => print_table(&snapshot),
                    commandline::MonitorOutput::Yaml => print_yaml(&snapshot)?,
                }
            }
        }
    }
    Ok(())
}

/// Prompts the user before a frame is injected onto the bus.
fn confirm_setpoint_write(slave: Slave, temperature: f32) -> Result<bool> {
    println!(
        "WARNING: Writing a setpoint sends a frame onto a bus that is driven by another \
         Modbus master. The frame may collide with its traffic."
    );
    Confirm::new()
        .with_prompt(format!(
            "Set the setpoint of slave {} to {temperature:.1} °C?",
            slave.0
        ))
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

/// Handles the set setpoint command.
///
/// Waits for the gateway connection, then sends the write frame.
async fn handle_set_setpoint(
    monitor: &Monitor,
    slave: Slave,
    temperature: f32,
    timeout: Duration,
) -> Result<()> {
    info!(
        "Executing: Set Setpoint of slave {} to {temperature} °C",
        slave.0
    );
    print!("Waiting for gateway connection... ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut connection = monitor.connection();
    let connected = tokio::time::timeout(timeout, connection.wait_for(|c| *c))
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);
    if !connected {
        println!("failed.");
        bail!("No connection to the gateway within {timeout:?}");
    }
    println!("connected.");

    monitor
        .write_setpoint(slave, temperature)
        .await
        .with_context(|| {
            format!(
                "Failed to write setpoint {temperature} °C to slave {}",
                slave.0
            )
        })?;
    println!(
        "Setpoint of slave {} set to {temperature:.1} °C. The slave's echo is not verified.",
        slave.0
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let _log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "rtumon started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Offline decoding needs no gateway
    let (address, command) = match &args.connection {
        commandline::CliConnection::Decode { bytes } => return handle_decode(&bytes.concat()),
        commandline::CliConnection::Tcp { address, command } => (address, command),
    };

    // 3. Load the monitor timing
    let monitor_config = config::get_config(args.config.as_deref())?;
    debug!("Monitor config: {monitor_config:?}");

    // 4. Execute the command
    let (monitor, result) = match command {
        commandline::CliCommands::Monitor { output } => {
            let monitor = Monitor::connect_tcp(address.clone(), monitor_config);
            let result = handle_monitor(&monitor, *output).await;
            (monitor, result)
        }
        commandline::CliCommands::SetSetpoint {
            slave,
            temperature,
            yes,
        } => {
            if !*yes && !confirm_setpoint_write(*slave, *temperature)? {
                info!("Setpoint write aborted by user.");
                return Ok(());
            }
            let monitor = Monitor::connect_tcp(address.clone(), monitor_config);
            let result = handle_set_setpoint(&monitor, *slave, *temperature, args.timeout).await;
            (monitor, result)
        }
    };

    // 5. Close the connection whatever the outcome
    monitor.close().await;
    result
}
