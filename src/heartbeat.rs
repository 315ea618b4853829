// Author: Lukas Bower
// Purpose: Periodic liveness probe of a running DSP.

//! Heartbeat monitor.
//!
//! A background thread sends a heartbeat request every period and reports
//! failures through a callback. Stopping the monitor wakes the thread
//! immediately instead of waiting out the period.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::device::Device;
use crate::error::XrpError;

/// Running heartbeat thread; stops when dropped.
#[derive(Debug)]
pub struct Heartbeat {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Heartbeat {
    /// Probe `device` every `period`, calling `on_failure` for each failed probe.
    pub fn start(
        device: Arc<Device>,
        period: Duration,
        on_failure: impl Fn(&XrpError) + Send + 'static,
    ) -> Result<Self, XrpError> {
        let (stop, rx) = mpsc::channel::<()>();
        let thread = thread::Builder::new()
            .name(format!("{}-heartbeat", device.node_name()))
            .spawn(move || loop {
                match rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => break,
                }
                if device.is_off() {
                    debug!(target: "xrp-heartbeat", "[heartbeat] device off, stopping");
                    break;
                }
                if !device.is_powered() {
                    continue;
                }
                if let Err(err) = device.heartbeat() {
                    warn!(target: "xrp-heartbeat", "[heartbeat] {} missed: {err}", device.node_name());
                    on_failure(&err);
                }
            })
            .map_err(|_| XrpError::invalid("cannot spawn heartbeat thread"))?;
        Ok(Self {
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    /// Stop the thread and wait for it.
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}
