// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

// XMODEM / YMODEM / YMODEM-G receiver
mod block;
mod crc;
mod protocol;
mod receiver;
mod serial;
mod sink;

use clap::Parser;
use serialport::{DataBits, Parity, StopBits};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use protocol::Protocol;
use serial::RealSerialPort;
use sink::DirSink;

#[derive(Parser)]
#[command(name = "xyrecv")]
#[command(about = "XMODEM/YMODEM/YMODEM-G file reception over a serial line", long_about = None)]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Serial port to use (e.g., /dev/ttyUSB0 or COM1)
    #[arg(short, long)]
    port: String,

    /// Baud rate
    #[arg(short, long, default_value = "115200")]
    baud: u32,

    /// Data bits (5, 6, 7, or 8)
    #[arg(long, default_value = "8", value_name = "BITS")]
    data_bits: u8,

    /// Parity (none, odd, or even)
    #[arg(long, default_value = "none")]
    parity: String,

    /// Stop bits (1 or 2)
    #[arg(long, default_value = "1", value_name = "BITS")]
    stop_bits: u8,

    /// Protocol variant (xmodem, ymodem, or ymodem-g)
    #[arg(long, default_value = "ymodem", value_name = "PROTO")]
    protocol: String,

    /// Directory to save received files
    #[arg(short, long, default_value = ".")]
    output_dir: PathBuf,

    /// Filename for XMODEM transfers, which carry none on the wire
    #[arg(long, default_value = "xmodem.bin", value_name = "NAME")]
    name: String,
}

fn parse_data_bits(bits: u8) -> Result<DataBits, String> {
    match bits {
        5 => Ok(DataBits::Five),
        6 => Ok(DataBits::Six),
        7 => Ok(DataBits::Seven),
        8 => Ok(DataBits::Eight),
        _ => Err(format!("Invalid data bits: {}. Must be 5, 6, 7, or 8", bits)),
    }
}

fn parse_parity(parity: &str) -> Result<Parity, String> {
    match parity.to_lowercase().as_str() {
        "none" => Ok(Parity::None),
        "odd" => Ok(Parity::Odd),
        "even" => Ok(Parity::Even),
        _ => Err(format!("Invalid parity: {}. Must be 'none', 'odd', or 'even'", parity)),
    }
}

fn parse_stop_bits(bits: u8) -> Result<StopBits, String> {
    match bits {
        1 => Ok(StopBits::One),
        2 => Ok(StopBits::Two),
        _ => Err(format!("Invalid stop bits: {}. Must be 1 or 2", bits)),
    }
}

fn parse_protocol(proto: &str) -> Result<Protocol, String> {
    match proto.to_lowercase().as_str() {
        "xmodem" => Ok(Protocol::Xmodem),
        "ymodem" => Ok(Protocol::Ymodem),
        "ymodem-g" | "ymodemg" => Ok(Protocol::YmodemG),
        _ => Err(format!(
            "Invalid protocol: {}. Must be 'xmodem', 'ymodem', or 'ymodem-g'",
            proto
        )),
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let data_bits = match parse_data_bits(cli.data_bits) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let parity = match parse_parity(&cli.parity) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let stop_bits = match parse_stop_bits(cli.stop_bits) {
        Ok(sb) => sb,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let protocol = match parse_protocol(&cli.protocol) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if !cli.output_dir.exists() {
        eprintln!("Error: output directory not found: {}", cli.output_dir.display());
        std::process::exit(1);
    }

    println!("Opening serial port: {}", cli.port);
    println!("Settings: {} baud, {:?}, {:?}, {:?}", cli.baud, data_bits, parity, stop_bits);

    let serial_port = match RealSerialPort::open(&cli.port, cli.baud, data_bits, parity, stop_bits) {
        Ok(port) => port,
        Err(e) => {
            eprintln!("Failed to open serial port: {}", e);
            std::process::exit(1);
        }
    };

    println!("\nReceiving files to: {}", cli.output_dir.display());

    let sink = DirSink::new(cli.output_dir);
    let session = receiver::open_session(Box::new(serial_port), Box::new(sink), protocol, &cli.name);

    match receiver::run(session) {
        Ok(()) => println!("\nFiles received successfully!"),
        Err(e) => {
            eprintln!("Receive failed: {}", e);
            std::process::exit(1);
        }
    }
}
