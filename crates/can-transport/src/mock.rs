use crate::{BusInfo, CanBus, CanDriver, CanFrame, Result, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A scriptable in-process adapter backend.
///
/// Clones share state, so a test can keep one clone to script discovery, inject frames and
/// inspect what the bridge sent while the bridge owns another.
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    inner: Mutex<MockInner>,
    rx_ready: Condvar,
}

#[derive(Default)]
struct MockInner {
    adapters: usize,
    scan_script: VecDeque<usize>,
    scans: usize,
    opens: usize,
    stops: usize,
    accepted_bitrates: Option<Vec<u32>>,
    bitrate: Option<u32>,
    started: bool,
    failing_starts: usize,
    failing_bitrates: usize,
    loopback: bool,
    rx: VecDeque<CanFrame>,
    tx: Vec<CanFrame>,
    recv_error: Option<String>,
    send_error: Option<String>,
}

impl MockDriver {
    /// One adapter named `mock0`, accepting any bitrate.
    pub fn new() -> Self {
        Self::with_adapters(1)
    }

    pub fn with_adapters(adapters: usize) -> Self {
        let driver = Self::default();
        driver.lock().adapters = adapters;
        driver
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        lock_state(&self.state)
    }

    /// Adapter counts reported by the next scans, in order. Once exhausted, scans report the
    /// count given at construction.
    pub fn script_scans(&self, counts: impl IntoIterator<Item = usize>) {
        self.lock().scan_script.extend(counts);
    }

    /// Restrict the bitrates the adapter accepts.
    pub fn accept_bitrates(&self, rates: &[u32]) {
        self.lock().accepted_bitrates = Some(rates.to_vec());
    }

    /// Echo every sent frame back as a received frame.
    pub fn set_loopback(&self, on: bool) {
        self.lock().loopback = on;
    }

    /// Make the next `n` start attempts fail.
    pub fn fail_starts(&self, n: usize) {
        self.lock().failing_starts = n;
    }

    /// Make the next `n` bitrate writes fail with an I/O error, as an unplugged adapter would.
    pub fn fail_bitrate_writes(&self, n: usize) {
        self.lock().failing_bitrates = n;
    }

    /// Make the next receive fail with an I/O error.
    pub fn fail_next_recv(&self, msg: &str) {
        self.lock().recv_error = Some(msg.to_string());
        self.state.rx_ready.notify_all();
    }

    /// Make sends fail until cleared with `None`.
    pub fn fail_sends(&self, msg: Option<&str>) {
        self.lock().send_error = msg.map(str::to_string);
    }

    /// Queue a frame for the adapter to receive.
    pub fn inject(&self, frame: CanFrame) {
        self.lock().rx.push_back(frame);
        self.state.rx_ready.notify_all();
    }

    pub fn sent_frames(&self) -> Vec<CanFrame> {
        self.lock().tx.clone()
    }

    pub fn scan_count(&self) -> usize {
        self.lock().scans
    }

    pub fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub fn stop_count(&self) -> usize {
        self.lock().stops
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn bitrate(&self) -> Option<u32> {
        self.lock().bitrate
    }
}

fn lock_state(state: &MockState) -> MutexGuard<'_, MockInner> {
    // The mock never panics while holding the lock; recover the data either way.
    state
        .inner
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CanDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    fn scan(&self) -> Result<Vec<BusInfo>> {
        let mut inner = self.lock();
        inner.scans += 1;
        let count = match inner.scan_script.pop_front() {
            Some(n) => n,
            None => inner.adapters,
        };
        Ok((0..count)
            .map(|i| BusInfo {
                name: format!("mock{i}"),
                driver: "mock".to_string(),
            })
            .collect())
    }

    fn open(&self, info: &BusInfo) -> Result<Box<dyn CanBus>> {
        self.lock().opens += 1;
        Ok(Box::new(MockBus {
            name: info.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// An opened mock adapter. Every bus opened from one driver shares its state.
pub struct MockBus {
    name: String,
    state: Arc<MockState>,
}

impl CanBus for MockBus {
    fn set_bitrate(&mut self, bitrate: u32) -> Result<()> {
        let mut inner = lock_state(&self.state);
        if inner.failing_bitrates > 0 {
            inner.failing_bitrates -= 1;
            return Err(TransportError::Io(format!("{}: write failed", self.name)));
        }
        if let Some(rates) = &inner.accepted_bitrates {
            if !rates.contains(&bitrate) {
                return Err(TransportError::BitrateRejected(bitrate));
            }
        }
        inner.bitrate = Some(bitrate);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        let mut inner = lock_state(&self.state);
        if inner.failing_starts > 0 {
            inner.failing_starts -= 1;
            return Err(TransportError::Io(format!("{}: start refused", self.name)));
        }
        inner.started = true;
        Ok(())
    }

    fn recv(&mut self, timeout_ms: Option<u64>) -> Result<CanFrame> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut inner = lock_state(&self.state);
        loop {
            if !inner.started {
                return Err(TransportError::NotStarted);
            }
            if let Some(msg) = inner.recv_error.take() {
                return Err(TransportError::Io(msg));
            }
            if let Some(frame) = inner.rx.pop_front() {
                return Ok(frame.stamped_now());
            }
            let wait = match deadline {
                Some(d) => match d.checked_duration_since(Instant::now()) {
                    Some(left) if !left.is_zero() => left,
                    _ => return Err(TransportError::Timeout),
                },
                None => Duration::from_millis(100),
            };
            inner = match self.state.rx_ready.wait_timeout(inner, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let mut inner = lock_state(&self.state);
        if !inner.started {
            return Err(TransportError::NotStarted);
        }
        if let Some(msg) = &inner.send_error {
            return Err(TransportError::Io(msg.clone()));
        }
        inner.tx.push(frame.clone());
        if inner.loopback {
            inner.rx.push_back(frame.clone());
            self.state.rx_ready.notify_all();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut inner = lock_state(&self.state);
        if inner.started {
            inner.started = false;
            inner.stops += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CanId;

    fn frame(id: u16, data: &[u8]) -> CanFrame {
        CanFrame::new(CanId::standard(id).unwrap(), data).unwrap()
    }

    #[test]
    fn test_scripted_scans_fall_back_to_default() {
        let driver = MockDriver::new();
        driver.script_scans([0, 2]);
        assert_eq!(driver.scan().unwrap().len(), 0);
        assert_eq!(driver.scan().unwrap().len(), 2);
        assert_eq!(driver.scan().unwrap().len(), 1);
        assert_eq!(driver.scan_count(), 3);
    }

    #[test]
    fn test_recv_times_out_without_frames() {
        let driver = MockDriver::new();
        let info = driver.scan().unwrap().remove(0);
        let mut bus = driver.open(&info).unwrap();
        bus.start().unwrap();
        let err = bus.recv(Some(10)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_loopback_echoes_sent_frames() {
        let driver = MockDriver::new();
        driver.set_loopback(true);
        let info = driver.scan().unwrap().remove(0);
        let mut bus = driver.open(&info).unwrap();
        bus.start().unwrap();
        bus.send(&frame(0x123, &[1, 2])).unwrap();
        let got = bus.recv(Some(10)).unwrap();
        assert_eq!(got.payload(), &[1, 2]);
        assert!(got.timestamp.is_some());
        assert_eq!(driver.sent_frames().len(), 1);
    }

    #[test]
    fn test_bitrate_rejection() {
        let driver = MockDriver::new();
        driver.accept_bitrates(&[500_000]);
        let info = driver.scan().unwrap().remove(0);
        let mut bus = driver.open(&info).unwrap();
        assert!(matches!(
            bus.set_bitrate(250_000),
            Err(TransportError::BitrateRejected(250_000))
        ));
        assert!(bus.set_bitrate(500_000).is_ok());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let driver = MockDriver::new();
        let info = driver.scan().unwrap().remove(0);
        let mut bus = driver.open(&info).unwrap();
        bus.start().unwrap();
        bus.stop().unwrap();
        bus.stop().unwrap();
        assert_eq!(driver.stop_count(), 1);
        assert!(matches!(bus.recv(Some(1)), Err(TransportError::NotStarted)));
    }
}
