use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{OnceLock, mpsc};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

/// Target of structured lifecycle events emitted through `tracing`.
pub const ANALYTICS_TARGET: &str = "testbed::analytics";

/// Columns of the statistics file, in output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StatParameter {
    /// Seconds since the collector was started.
    Time,

    /// Why this entry was written.
    LogDescription,

    /// Component that caused the entry ("BOOKING", "SCHEDULER", "TRACKER").
    Component,

    ExperimentId,
    ExperimentName,
    FromStatus,
    ToStatus,

    /// Number of nodes in the experiment.
    NodeCount,

    /// Nodes whose logs were retrieved when the entry was written.
    RetrievedCount,
}

impl StatParameter {
    pub const ALL: [StatParameter; 9] = [
        StatParameter::Time,
        StatParameter::LogDescription,
        StatParameter::Component,
        StatParameter::ExperimentId,
        StatParameter::ExperimentName,
        StatParameter::FromStatus,
        StatParameter::ToStatus,
        StatParameter::NodeCount,
        StatParameter::RetrievedCount,
    ];

    pub fn header(self) -> &'static str {
        match self {
            StatParameter::Time => "Time",
            StatParameter::LogDescription => "LogDescription",
            StatParameter::Component => "Component",
            StatParameter::ExperimentId => "ExperimentId",
            StatParameter::ExperimentName => "ExperimentName",
            StatParameter::FromStatus => "FromStatus",
            StatParameter::ToStatus => "ToStatus",
            StatParameter::NodeCount => "NodeCount",
            StatParameter::RetrievedCount => "RetrievedCount",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum StatValue {
    Integer(i64),
    Text(String),
}

impl From<i64> for StatValue {
    fn from(v: i64) -> Self {
        StatValue::Integer(v)
    }
}

impl From<u64> for StatValue {
    fn from(v: u64) -> Self {
        StatValue::Integer(v as i64)
    }
}

impl From<usize> for StatValue {
    fn from(v: usize) -> Self {
        StatValue::Integer(v as i64)
    }
}

impl From<String> for StatValue {
    fn from(v: String) -> Self {
        StatValue::Text(v)
    }
}

impl From<&str> for StatValue {
    fn from(v: &str) -> Self {
        StatValue::Text(v.to_string())
    }
}

impl std::fmt::Display for StatValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatValue::Integer(i) => write!(f, "{}", i),
            StatValue::Text(t) => f.write_str(t),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StatisticEvent {
    data: HashMap<StatParameter, StatValue>,
}

impl StatisticEvent {
    pub fn new() -> Self {
        Self { data: HashMap::new() }
    }

    pub fn set<V: Into<StatValue>>(&mut self, param: StatParameter, value: V) -> &mut Self {
        self.data.insert(param, value.into());
        self
    }

    pub fn get(&self, param: StatParameter) -> Option<&StatValue> {
        self.data.get(&param)
    }

    fn to_row(&self) -> Vec<String> {
        StatParameter::ALL.iter().map(|param| self.data.get(param).map(ToString::to_string).unwrap_or_else(|| "NA".to_string())).collect()
    }
}

enum StatsMessage {
    Log(StatisticEvent),
    Flush,
}

/// Writes statistic events as `;` separated CSV on a background thread.
#[derive(Debug)]
pub struct StatsCollector {
    sender: mpsc::Sender<StatsMessage>,
    start_time: u64,
}

impl std::fmt::Debug for StatsMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatsMessage::Log(_) => f.write_str("Log"),
            StatsMessage::Flush => f.write_str("Flush"),
        }
    }
}

impl StatsCollector {
    /// Spawns the writer thread. Without a file the rows go to stdout.
    pub fn init(filename: Option<PathBuf>) -> io::Result<Self> {
        let writer: Box<dyn Write + Send> = match filename {
            Some(path) => Box::new(File::create(path)?),
            None => Box::new(io::stdout()),
        };

        let (tx, rx) = mpsc::channel();
        let start_time = unix_seconds();

        thread::Builder::new().name("statistics-writer".to_string()).spawn(move || Self::worker_loop(rx, writer))?;

        Ok(StatsCollector { sender: tx, start_time })
    }

    fn worker_loop(rx: mpsc::Receiver<StatsMessage>, writer: Box<dyn Write + Send>) {
        let mut csv_wtr = csv::WriterBuilder::new().delimiter(b';').from_writer(writer);

        let headers: Vec<&str> = StatParameter::ALL.iter().map(|param| param.header()).collect();
        if let Err(e) = csv_wtr.write_record(&headers) {
            log::error!("Stats Error: Failed to write headers: {}", e);
        }

        for msg in rx {
            match msg {
                StatsMessage::Log(event) => {
                    if let Err(e) = csv_wtr.write_record(event.to_row()) {
                        log::error!("Stats Error: Failed to write record: {}", e);
                    }
                }
                StatsMessage::Flush => {
                    let _ = csv_wtr.flush();
                }
            }
        }

        let _ = csv_wtr.flush();
    }

    /// Queues an event; never blocks.
    pub fn add_event(&self, mut event: StatisticEvent) {
        if event.get(StatParameter::Time).is_none() {
            event.set(StatParameter::Time, unix_seconds().saturating_sub(self.start_time));
        }

        let _ = self.sender.send(StatsMessage::Log(event));
    }

    pub fn flush(&self) {
        let _ = self.sender.send(StatsMessage::Flush);
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

static GLOBAL_STATS: OnceLock<StatsCollector> = OnceLock::new();

/// Initialises the process wide collector. Later calls are ignored.
pub fn init_global(filename: Option<PathBuf>) -> io::Result<()> {
    let collector = StatsCollector::init(filename)?;
    let _ = GLOBAL_STATS.set(collector);
    Ok(())
}

/// Logs an event to the global collector, if one was initialised.
pub fn add_global_event(event: StatisticEvent) {
    if let Some(collector) = GLOBAL_STATS.get() {
        collector.add_event(event);
    }
}

pub fn flush_global() {
    if let Some(collector) = GLOBAL_STATS.get() {
        collector.flush();
    }
}
