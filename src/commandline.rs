use clap::{Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use rtu_monitor_lib::protocol as proto;
use std::path::PathBuf;
use std::time::Duration;
use tokio_modbus::Slave;

fn parse_slave(s: &str) -> Result<Slave, String> {
    let slave_id =
        clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid slave id format: {e}"))?;
    proto::check_unicast_slave(slave_id).map_err(|e| e.to_string())
}

fn parse_degree_celsius(s: &str) -> Result<f32, String> {
    let temp_val = s
        .parse::<f32>()
        .map_err(|e| format!("Invalid temperature value format: {e}"))?;
    proto::setpoint_encode(temp_val).map_err(|e| e.to_string())?;
    Ok(temp_val)
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, String> {
    let digits: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != ',')
        .collect();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(&digits);
    hex::decode(digits).map_err(|e| format!("Invalid hex bytes: {e}"))
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the serial-to-TCP gateway of the heating controller bus.
    Tcp {
        /// The IP address or hostname and port of the gateway.
        /// Example: "192.168.1.50:502" or "rs485-gateway.local:4196".
        #[clap(verbatim_doc_comment)]
        address: String,

        /// Commands that need the gateway.
        #[command(subcommand)]
        command: CliCommands,
    },
    /// Decode raw bus bytes offline.
    /// The bytes are fed through the same re-framing as live traffic and every
    /// recovered frame is printed.
    /// Example: "03 03 00 83 00 04 B4 03".
    #[clap(verbatim_doc_comment)]
    Decode {
        /// Hex encoded bytes, in one or more arguments.
        /// Whitespace, ':' and ',' separators are ignored.
        #[arg(value_parser = parse_hex_bytes, required = true, num_args = 1.., verbatim_doc_comment)]
        bytes: Vec<Vec<u8>>,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MonitorOutput {
    /// Human readable table with named registers.
    #[default]
    Table,
    /// YAML document per update.
    Yaml,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Passively listen to the bus and print the state of every slave whenever it changes.
    /// Nothing is sent to the bus. Stop with Ctrl-C.
    #[clap(verbatim_doc_comment)]
    Monitor {
        /// Output format.
        #[arg(value_enum, default_value_t = MonitorOutput::default())]
        output: MonitorOutput,
    },

    /// Write a new target temperature to the setpoint register of one zone.
    /// **Warning:** This injects a frame onto a bus that is owned by another
    /// Modbus master and may collide with its traffic.
    #[clap(verbatim_doc_comment)]
    SetSetpoint {
        /// Slave id of the zone (1 to 247).
        /// Can be specified in decimal or hexadecimal (e.g., "0x05").
        #[arg(value_parser = parse_slave, verbatim_doc_comment)]
        slave: Slave,

        /// Target temperature in degrees Celsius (°C), 0.1°C resolution.
        #[arg(value_parser = parse_degree_celsius, allow_negative_numbers = true)]
        temperature: f32,

        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

const fn about_text() -> &'static str {
    "Modbus RTU monitor CLI - Passively watch a heating controller bus through a serial-to-TCP gateway."
}

#[derive(Parser, Debug)]
#[command(name="rtumon", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and commands.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// How long to wait for the gateway connection before giving up on a write.
    /// Examples: "10s", "1m".
    #[arg(global = true, long, default_value = "10s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// YAML file with the monitor timing.
    /// Defaults to "rtumon.yml" in the working directory if it exists.
    #[arg(global = true, long, verbatim_doc_comment)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        CliArgs::command().debug_assert();
    }

    #[test]
    fn parse_set_setpoint() {
        let args = CliArgs::try_parse_from([
            "rtumon",
            "tcp",
            "10.0.0.2:502",
            "set-setpoint",
            "0x05",
            "21.5",
        ])
        .unwrap();
        assert_eq!(
            args.connection,
            CliConnection::Tcp {
                address: "10.0.0.2:502".to_string(),
                command: CliCommands::SetSetpoint {
                    slave: Slave(5),
                    temperature: 21.5,
                    yes: false,
                },
            }
        );
        assert_eq!(args.timeout, Duration::from_secs(10));
    }

    #[test]
    fn parse_decode_arguments() {
        let args = CliArgs::try_parse_from(["rtumon", "decode", "03 03", "00", "83"]).unwrap();
        assert_eq!(
            args.connection,
            CliConnection::Decode {
                bytes: vec![vec![0x03, 0x03], vec![0x00], vec![0x83]],
            }
        );
        assert!(CliArgs::try_parse_from(["rtumon", "decode"]).is_err());
    }

    #[test]
    fn reject_broadcast_slave() {
        assert!(parse_slave("0").is_err());
        assert!(parse_slave("248").is_err());
        assert_eq!(parse_slave("247"), Ok(Slave(247)));
    }

    #[test]
    fn reject_unencodable_setpoint() {
        assert!(parse_degree_celsius("7000").is_err());
        assert!(parse_degree_celsius("-1").is_err());
        assert!(parse_degree_celsius("warm").is_err());
        assert_eq!(parse_degree_celsius("19.5"), Ok(19.5));
    }

    #[test]
    fn hex_input() {
        assert_eq!(
            parse_hex_bytes("03 03 00 83"),
            Ok(vec![0x03, 0x03, 0x00, 0x83])
        );
        assert_eq!(parse_hex_bytes("0x0a:ff"), Ok(vec![0x0A, 0xFF]));
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
        assert!(parse_hex_bytes("0é").is_err());
    }
}
