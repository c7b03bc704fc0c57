//! CLI front-end: runs either the writer (ingest from upstream, persist to
//! disk) or a single ad hoc reader session (stream from disk to stdout-style
//! logging), selected via `--mode`. Grounded on
//! `original_source/pinloki/test/main.cc`'s `--mode {writer,reader}`
//! `getopt_long` surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use pinloki::config::Config;
use pinloki::control::{ControlSurface, Controller};
use pinloki::file_transformer::FileTransformer;
use pinloki::gtid::GtidList;
use pinloki::inventory::{InventoryReader, InventoryWriter};
use pinloki::reader::{Downstream, Reader};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Writer,
    Reader,
}

#[derive(Debug, Parser)]
#[command(name = "pinloki", about = "Replicated binary-log relay and archive engine")]
struct Cli {
    /// Path to the TOML config file (datadir, server_id, upstream host, ...).
    #[arg(long, default_value = "pinloki.toml")]
    config: PathBuf,

    /// Run the upstream-ingestion writer, or a standalone reader session.
    #[arg(long, value_enum, default_value_t = Mode::Writer)]
    mode: Mode,

    /// Starting GTID list for a reader session (e.g. "0-1-100"); defaults to
    /// the persisted replication position.
    #[arg(long)]
    gtid: Option<String>,

    #[arg(short, long)]
    verbose: bool,
}

/// Logs every event to stdout at debug level; exists to give `--mode reader`
/// something to drive without needing a real downstream connection.
struct LoggingDownstream;

impl Downstream for LoggingDownstream {
    fn send(&mut self, event: &pinloki::event::Event) -> pinloki::error::Result<()> {
        log::debug!(target: "pinloki", "event type {} at pos {}", event.event_type(), event.header.next_event_pos);
        Ok(())
    }

    fn is_back_pressured(&self) -> bool {
        false
    }
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if let Err(e) = run(cli) {
        log::error!(target: "pinloki", "fatal: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> pinloki::error::Result<()> {
    let config = Arc::new(Config::load(&cli.config)?);
    let inventory_writer = Arc::new(InventoryWriter::new(config.clone())?);
    let transformer = FileTransformer::spawn(config.clone(), inventory_writer.clone());

    match cli.mode {
        Mode::Writer => {
            let controller = Controller::new(config, inventory_writer, transformer.clone())?;
            controller.start_slave()?;
            log::info!(target: "pinloki", "writer started, blocking; send SIGINT to stop");
            loop {
                std::thread::sleep(Duration::from_secs(60));
            }
        }
        Mode::Reader => {
            let requested = match cli.gtid {
                Some(s) => GtidList::from_string(&s)?,
                None => config.rpl_state()?,
            };
            let reader = Reader::new(config.clone(), Arc::new(InventoryReader::new(config)), requested);
            let mut downstream = LoggingDownstream;
            reader.run(&mut downstream)
        }
    }
}
