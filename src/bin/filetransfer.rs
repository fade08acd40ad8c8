//! Drives one end of a file transfer over a real serial port.
//!
//! `filetransfer --device /dev/ttyUSB0 --role tx --file report.bin` sends a
//! file; the same command with `--role rx --file out.bin` receives one.

use std::fs;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, LevelFilter};

use arq_link::app::{receive_file, send_file};
use arq_link::engine::ConnectionParams;
use arq_link::serial::RealSerialPort;
use arq_link::LinkLayer;

#[derive(Parser, Debug)]
#[command(about = "Send or receive a file over a stop-and-wait ARQ serial link")]
struct Args {
    /// Serial device, e.g. /dev/ttyUSB0.
    #[arg(long)]
    device: String,

    /// "tx" to send `--file`, "rx" to receive into it.
    #[arg(long)]
    role: String,

    /// Line speed in bits per second.
    #[arg(long, default_value_t = 115200)]
    baud: u32,

    /// Number of timeouts tolerated before an operation fails.
    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Seconds to wait for a reply before retransmitting.
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    /// File to send (tx) or write to (rx).
    #[arg(long)]
    file: String,

    /// Print the link-layer statistics summary after closing.
    #[arg(long)]
    stats: bool,
}

fn run(args: Args) -> arq_link::Result<()> {
    let params = ConnectionParams::new(&args.role, args.retries, args.timeout)?;
    let port = RealSerialPort::open(&args.device, args.baud)?;
    let mut link = LinkLayer::new(port, params.clone());

    link.open()?;
    info!("link open on {}", args.device);

    match params.role {
        arq_link::Role::Transmitter => {
            let data = fs::read(&args.file)?;
            send_file(&mut link, &args.file, &data)?;
            info!("sent {} bytes from {}", data.len(), args.file);
        }
        arq_link::Role::Receiver => {
            let (filename, data) = receive_file(&mut link)?;
            fs::write(&args.file, &data)?;
            info!("received {} bytes as {filename:?}, wrote to {}", data.len(), args.file);
        }
    }

    link.close(args.stats)?;
    if args.stats {
        println!("{}", link.stats());
    }
    Ok(())
}

fn main() -> ExitCode {
    log::set_max_level(LevelFilter::Debug);
    env_logger::init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("file transfer failed: {e}");
            ExitCode::FAILURE
        }
    }
}
