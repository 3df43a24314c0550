use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::line::LogLine;

pub const DEFAULT_SERVICE_CAPACITY: usize = 1000;
pub const DEFAULT_GLOBAL_CAPACITY: usize = 1000;

/// Bounded log storage: one FIFO per service plus a global interleaved
/// FIFO. A single mutex covers both views so an append is atomic and a
/// reader can never observe a torn line.
#[derive(Debug)]
pub struct LogStore {
    service_capacity: usize,
    global_capacity: usize,
    inner: Mutex<Buffers>,
}

#[derive(Debug, Default)]
struct Buffers {
    per_service: HashMap<String, VecDeque<LogLine>>,
    global: VecDeque<LogLine>,
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new(DEFAULT_SERVICE_CAPACITY, DEFAULT_GLOBAL_CAPACITY)
    }
}

impl LogStore {
    pub fn new(service_capacity: usize, global_capacity: usize) -> Self {
        Self {
            service_capacity,
            global_capacity,
            inner: Mutex::new(Buffers::default()),
        }
    }

    /// Appends into both the service FIFO and the global FIFO, evicting
    /// the oldest entry of each on overflow.
    pub fn append(&self, line: LogLine) {
        let mut inner = self.inner.lock();

        let buf = inner
            .per_service
            .entry(line.service.clone())
            .or_insert_with(|| VecDeque::with_capacity(64));
        buf.push_back(line.clone());
        while buf.len() > self.service_capacity {
            buf.pop_front();
        }

        inner.global.push_back(line);
        while inner.global.len() > self.global_capacity {
            inner.global.pop_front();
        }
    }

    /// Snapshot of the last `n` lines for one service, oldest first.
    pub fn tail(&self, service: &str, n: usize) -> Vec<LogLine> {
        let inner = self.inner.lock();
        match inner.per_service.get(service) {
            Some(buf) => buf.iter().skip(buf.len().saturating_sub(n)).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the last `n` lines across all services, oldest first.
    pub fn tail_global(&self, n: usize) -> Vec<LogLine> {
        let inner = self.inner.lock();
        inner
            .global
            .iter()
            .skip(inner.global.len().saturating_sub(n))
            .cloned()
            .collect()
    }

    pub fn len(&self, service: &str) -> usize {
        self.inner
            .lock()
            .per_service
            .get(service)
            .map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().global.is_empty()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.inner.lock().per_service.keys().cloned().collect()
    }

    /// Empties one service's FIFO and purges its entries from the
    /// global view.
    pub fn clear_service(&self, service: &str) {
        let mut inner = self.inner.lock();
        inner.per_service.remove(service);
        inner.global.retain(|line| line.service != service);
    }

    pub fn clear_all(&self) {
        let mut inner = self.inner.lock();
        inner.per_service.clear();
        inner.global.clear();
    }
}
