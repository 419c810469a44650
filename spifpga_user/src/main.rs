//! Command line access to FPGA registers over SPI

mod logging;

use anyhow::{
    bail,
    Context,
};
use clap::{
    Parser,
    Subcommand,
};
use indicatif::ProgressBar;
use spifpga::{
    client::Client,
    config::{
        Config,
        Mode,
        Settings,
        DEFAULT_BUFSIZ,
        DEFAULT_SPEED_HZ,
    },
    session::SessionKey,
    transport::{
        mock::Mock,
        Controller,
    },
};
use std::{
    io::{
        self,
        Read,
        Seek,
        SeekFrom,
        Write,
    },
    path::PathBuf,
};
use tracing::{
    info,
    warn,
};

use crate::logging::{
    init_logging,
    LogLevel,
};

/// Words written or read per step of the bulk test
const CHUNK_WORDS: usize = 256;

/// Parse an integer the way `strtol` does with base 0: `0x` for hex, a leading `0` for octal,
/// decimal otherwise
fn parse_int(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    u64::from_str_radix(digits, radix).map_err(|e| format!("invalid integer `{s}`: {e}"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    u32::try_from(parse_int(s)?).map_err(|_| format!("`{s}` doesn't fit in 32 bits"))
}

fn parse_usize(s: &str) -> Result<usize, String> {
    usize::try_from(parse_int(s)?).map_err(|_| format!("`{s}` is too large"))
}

#[derive(Parser, Debug)]
#[command(name = "spifpga", version, about = "Read and write FPGA registers over SPI")]
struct Cli {
    /// The spidev node the FPGA is attached to
    #[arg(
        long,
        env = "SPIFPGA_DEVICE",
        default_value = "/dev/spidev0.0",
        global = true
    )]
    device: PathBuf,

    /// Scratch buffer size in bytes, bounds how many words go out per transaction
    #[arg(long, env = "SPIFPGA_BUFSIZ", default_value_t = DEFAULT_BUFSIZ, value_parser = parse_usize, global = true)]
    bufsiz: usize,

    /// Maximum SPI clock in Hz
    #[arg(long, env = "SPIFPGA_SPEED", default_value_t = DEFAULT_SPEED_HZ, value_parser = parse_u32, global = true)]
    speed: u32,

    /// SPI mode bits (CPHA = 0x01, CPOL = 0x02, CS_HIGH = 0x04, LSB_FIRST = 0x08, ...)
    #[arg(long, default_value_t = 0, value_parser = parse_u32, global = true)]
    mode: u32,

    /// Talk to a simulated FPGA instead of the device
    #[arg(long, global = true)]
    mock: bool,

    /// Minimum log level (stderr)
    #[arg(long, value_name = "LEVEL", default_value = "warn", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read one register
    Read {
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
    },
    /// Write one register
    Write {
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
        #[arg(long, value_parser = parse_u32)]
        data: u32,
    },
    /// Copy raw register bytes to stdout
    Dump {
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
        #[arg(long, value_parser = parse_usize)]
        len: usize,
    },
    /// Copy raw register bytes from stdin, whole words only
    Load {
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
    },
    /// Write an incrementing pattern and read it back
    BulkTest {
        #[arg(long, value_parser = parse_u32)]
        addr: u32,
        #[arg(long, default_value_t = 1024, value_parser = parse_usize)]
        words: usize,
    },
}

impl Cli {
    fn config(&self) -> anyhow::Result<Config> {
        let flags = Mode::from_bits(self.mode).context("unsupported --mode")?;
        info!(mode = flags.number(), lsb_first = flags.lsb_first, "SPI mode");
        let config = Config::default()
            .with_bufsiz(self.bufsiz)
            .with_settings(Settings {
                mode: self.mode,
                max_speed_hz: self.speed,
                ..Default::default()
            });
        config.validate()?;
        Ok(config)
    }
}

/// Write a pattern in chunks, read it back and count the words that differ
fn bulk_test<C: Controller>(client: &Client<C>, addr: u32, words: usize) -> anyhow::Result<usize> {
    let pattern: Vec<u8> = (0u32..).take(words).flat_map(u32::to_le_bytes).collect();
    let chunk_bytes = CHUNK_WORDS * 4;
    let chunks = pattern.chunks(chunk_bytes).len();
    let bar = ProgressBar::new(2 * chunks as u64);
    bar.set_message("Writing");
    for (i, chunk) in pattern.chunks(chunk_bytes).enumerate() {
        let offset = addr.wrapping_add(u32::try_from(i * chunk_bytes)?);
        client.bulk_write(offset, chunk)?;
        bar.inc(1);
    }
    bar.set_message("Reading back");
    let mut back = vec![0u8; pattern.len()];
    for (i, chunk) in back.chunks_mut(chunk_bytes).enumerate() {
        let offset = addr.wrapping_add(u32::try_from(i * chunk_bytes)?);
        client.bulk_read(offset, chunk)?;
        bar.inc(1);
    }
    bar.finish_and_clear();
    let mismatches = pattern
        .chunks_exact(4)
        .zip(back.chunks_exact(4))
        .enumerate()
        .filter(|(i, (want, got))| {
            let differs = want != got;
            if differs {
                warn!(word = i, ?want, ?got, "Mismatch");
            }
            differs
        })
        .count();
    Ok(mismatches)
}

fn run<C, R, W>(client: Client<C>, command: Command, input: &mut R, out: &mut W) -> anyhow::Result<()>
where
    C: Controller,
    R: Read,
    W: Write,
{
    match command {
        Command::Read { addr } => {
            let word = client.read_word(addr)?;
            writeln!(out, "{addr:#010x}: {word:#010x}")?;
        }
        Command::Write { addr, data } => {
            client.write_word(addr, data)?;
            info!(addr, data, "Wrote register");
        }
        Command::Dump { addr, len } => {
            let mut port = client.into_port();
            port.seek(SeekFrom::Start(u64::from(addr)))?;
            let n = io::copy(&mut port.take(len as u64), out)?;
            if n < len as u64 {
                warn!(requested = len, copied = n, "Short dump");
            }
        }
        Command::Load { addr } => {
            let mut data = Vec::new();
            input.read_to_end(&mut data)?;
            if data.len() % 4 != 0 {
                bail!("input is {} bytes, not a whole number of words", data.len());
            }
            let n = client.bulk_write(addr, &data)?;
            info!(addr, bytes = n, "Loaded registers");
        }
        Command::BulkTest { addr, words } => {
            let mismatches = bulk_test(&client, addr, words)?;
            writeln!(out, "{words} words, {mismatches} mismatches")?;
            if mismatches > 0 {
                bail!("{mismatches} of {words} words read back wrong");
            }
        }
    }
    Ok(())
}

#[cfg(all(target_os = "linux", target_endian = "little"))]
fn run_device(cli: Cli, config: &Config) -> anyhow::Result<()> {
    let client = spifpga::client::config_spi(&cli.device, config)
        .with_context(|| format!("couldn't open {}", cli.device.display()))?;
    run(client, cli.command, &mut io::stdin().lock(), &mut io::stdout().lock())
}

#[cfg(not(all(target_os = "linux", target_endian = "little")))]
fn run_device(_cli: Cli, _config: &Config) -> anyhow::Result<()> {
    bail!("spidev devices are only supported on little endian Linux, try --mock")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    let config = cli.config()?;
    if cli.mock {
        let client = Client::new(SessionKey::new(0, 0), Mock::new(), &config)?;
        run(client, cli.command, &mut io::stdin().lock(), &mut io::stdout().lock())
    } else {
        run_device(cli, &config)
    }
}
