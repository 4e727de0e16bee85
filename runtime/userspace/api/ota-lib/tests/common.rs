// Licensed under the Apache-2.0 license
#![allow(dead_code)]

use log::LevelFilter;
use ota_config::boot::{PartitionId, RollbackEnable, RollbackState};
use ota_config::UpdateConfig;
use ota_config_emulator::flash::{PartitionInfo, PartitionKind, SECTOR_SIZE};
use ota_config_emulator::{FlashLayout, PartitionTable};
use ota_image::{parse_header, FirmwareVersion, ImageBuilder, MIN_HEADER_LEN};
use ota_lib::boot_cfg::FlashBootConfig;
use ota_lib::diagnostic::Diagnostic;
use ota_lib::fetch::{Connection, FetchError, ImageSource, StreamError};
use ota_lib::flash::{FlashPartition, FlashStorage, RamFlash};
use ota_lib::partition::PartitionDirectory;
use ota_lib::timer::Delay;
use simple_logger::SimpleLogger;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

pub const SLOT_SIZE: usize = 0x1_0000;

pub fn init_logger() {
    let _ = SimpleLogger::new().with_level(LevelFilter::Debug).init();
}

/// Boot data followed by two 64 KiB application slots.
pub fn test_layout() -> FlashLayout {
    FlashLayout::new(vec![
        PartitionInfo {
            name: "otadata",
            id: PartitionId::None,
            kind: PartitionKind::BootData,
            offset: 0,
            size: 2 * SECTOR_SIZE,
        },
        PartitionInfo {
            name: "ota_0",
            id: PartitionId::A,
            kind: PartitionKind::App,
            offset: 2 * SECTOR_SIZE,
            size: SLOT_SIZE,
        },
        PartitionInfo {
            name: "ota_1",
            id: PartitionId::B,
            kind: PartitionKind::App,
            offset: 2 * SECTOR_SIZE + SLOT_SIZE,
            size: SLOT_SIZE,
        },
    ])
}

pub fn image(version: &str) -> Vec<u8> {
    ImageBuilder::new(version)
        .project_name("ota-test")
        .payload((0..3000u32).map(|i| (i % 251) as u8).collect())
        .build()
}

/// Settings with short waits so retries and polls stay cheap.
pub fn test_config() -> UpdateConfig {
    UpdateConfig {
        firmware_url: "memory://image".into(),
        poll_interval_ms: 1,
        recv_timeout_ms: 20,
        ..Default::default()
    }
}

pub struct Device {
    pub flash: RamFlash,
    pub layout: FlashLayout,
}

impl Device {
    pub fn new() -> Self {
        Self::with_layout(test_layout())
    }

    pub fn with_layout(layout: FlashLayout) -> Self {
        Device {
            flash: RamFlash::new(layout.flash_size()),
            layout,
        }
    }

    /// Factory state: `version` in slot A, booting A, A confirmed.
    pub fn provision(&self, version: &str) {
        self.install(PartitionId::A, &image(version));
        let mut table = PartitionTable::new(PartitionId::A, RollbackEnable::Enabled);
        table.set_partition_state(PartitionId::A, RollbackState::Valid);
        self.boot_cfg().format(table).unwrap();
    }

    pub fn install(&self, slot: PartitionId, image: &[u8]) {
        let partition = self.slot(slot);
        partition.erase(0, partition.len()).unwrap();
        partition.write(0, image).unwrap();
    }

    pub fn slot(&self, slot: PartitionId) -> FlashPartition<'_> {
        FlashPartition::from_info(&self.flash, self.layout.app(slot).unwrap()).unwrap()
    }

    pub fn slot_bytes(&self, slot: PartitionId, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.slot(slot).read(0, &mut buf).unwrap();
        buf
    }

    pub fn slot_version(&self, slot: PartitionId) -> Option<FirmwareVersion> {
        let mut header = [0u8; MIN_HEADER_LEN];
        self.slot(slot).read(0, &mut header).ok()?;
        parse_header(&header).ok()
    }

    pub fn boot_cfg(&self) -> FlashBootConfig<'_> {
        FlashBootConfig::new(&self.flash, &self.layout).unwrap()
    }

    pub fn directory(&self, running: PartitionId) -> PartitionDirectory<'_> {
        PartitionDirectory::new(&self.flash as &dyn FlashStorage, &self.layout, running).unwrap()
    }
}

/// Serves one image from memory, with knobs for the failures a network
/// transfer can show.
pub struct MemorySource {
    image: Vec<u8>,
    chunk: usize,
    declare_length: bool,
    cut_at: Option<(usize, StreamError)>,
    pending_polls: usize,
    failing_connects: usize,
    connects: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new(image: Vec<u8>) -> Self {
        MemorySource {
            image,
            chunk: 1024,
            declare_length: true,
            cut_at: None,
            pending_polls: 0,
            failing_connects: 0,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk;
        self
    }

    pub fn without_length(mut self) -> Self {
        self.declare_length = false;
        self
    }

    /// The connection resets after `len` bytes.
    pub fn truncate_at(mut self, len: usize) -> Self {
        self.cut_at = Some((len, StreamError::Reset));
        self
    }

    /// Reads fail with a transport error after `len` bytes.
    pub fn body_error_at(mut self, len: usize) -> Self {
        self.cut_at = Some((len, StreamError::Io("response body error".into())));
        self
    }

    /// Reads return no data this many times before the body starts.
    pub fn pending_polls(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    pub fn failing_connects(mut self, count: usize) -> Self {
        self.failing_connects = count;
        self
    }

    pub fn connects(&self) -> Arc<AtomicUsize> {
        self.connects.clone()
    }
}

impl ImageSource for MemorySource {
    type Connection = MemoryConnection;

    fn connect(&self) -> Result<MemoryConnection, FetchError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failing_connects {
            return Err(FetchError::Unreachable(self.location()));
        }
        Ok(MemoryConnection {
            data: self.image.clone(),
            position: 0,
            chunk: self.chunk,
            declared: self.declare_length.then_some(self.image.len() as u64),
            cut_at: self.cut_at.clone(),
            pending_polls: self.pending_polls,
            finished: false,
        })
    }

    fn location(&self) -> String {
        "memory://image".into()
    }
}

pub struct MemoryConnection {
    data: Vec<u8>,
    position: usize,
    chunk: usize,
    declared: Option<u64>,
    cut_at: Option<(usize, StreamError)>,
    pending_polls: usize,
    finished: bool,
}

impl Connection for MemoryConnection {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.pending_polls > 0 {
            self.pending_polls -= 1;
            return Ok(0);
        }
        let limit = self.cut_at.as_ref().map_or(self.data.len(), |(len, _)| *len);
        if self.position >= limit {
            if let Some((_, err)) = &self.cut_at {
                return Err(err.clone());
            }
            self.finished = true;
            return Ok(0);
        }
        let len = buf.len().min(self.chunk).min(limit - self.position);
        buf[..len].copy_from_slice(&self.data[self.position..self.position + len]);
        self.position += len;
        Ok(len)
    }

    fn content_length(&self) -> Option<u64> {
        self.declared
    }

    fn body_finished(&self) -> bool {
        self.finished
    }
}

/// Records waits instead of sleeping.
#[derive(Default)]
pub struct RecordingDelay {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingDelay {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

impl Delay for RecordingDelay {
    fn delay(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
    }
}

pub struct ScriptedDiagnostic {
    pass: bool,
    runtime: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedDiagnostic {
    pub fn passing() -> Self {
        ScriptedDiagnostic {
            pass: true,
            runtime: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        ScriptedDiagnostic {
            pass: false,
            ..Self::passing()
        }
    }

    /// Passes, but only after really taking `runtime`.
    pub fn slow(runtime: Duration) -> Self {
        ScriptedDiagnostic {
            runtime: Some(runtime),
            ..Self::passing()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Diagnostic for ScriptedDiagnostic {
    fn run(&self, _budget: Duration) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(runtime) = self.runtime {
            thread::sleep(runtime);
        }
        self.pass
    }
}
