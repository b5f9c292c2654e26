//! Wakes the render loop while every device is a dummy.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub struct SilentModeTicker {
    stop: Option<Sender<()>>,
    wakes: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl SilentModeTicker {
    pub fn start(interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let (wake_tx, wake_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name("busmix-silent-mode".into())
            .spawn(move || loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {
                        // One pending wake is enough.
                        let _ = wake_tx.try_send(());
                    }
                }
            })?;
        log::debug!("silent mode ticker started ({:?})", interval);
        Ok(Self {
            stop: Some(stop_tx),
            wakes: wake_rx,
            handle: Some(handle),
        })
    }

    /// Block until the next wake or `timeout`.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wakes.recv_timeout(timeout).is_ok()
    }
}

impl Drop for SilentModeTicker {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("silent mode ticker panicked");
            }
        }
        log::debug!("silent mode ticker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticker_wakes_and_stops() {
        let ticker = SilentModeTicker::start(Duration::from_millis(2)).expect("spawn");
        assert!(ticker.wait(Duration::from_secs(2)));
        drop(ticker);
    }
}
