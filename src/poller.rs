use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex, PoisonError},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{configuration_loader::ConfigurationLoader, Error, Result};

/// Timing of the background refresh loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerThreadConfig {
    /// Upper bound of the delay between refreshes.
    pub interval: Duration,
    /// Up to this much is randomly subtracted from `interval` on each cycle, so that many
    /// processes started together don't poll in lockstep.
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default polling interval.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default polling jitter.
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A configuration poller thread.
///
/// Use [`Client::start_poller_thread`](crate::Client::start_poller_thread) to get an instance of
/// it.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::Sender<()>,

    /// Holds `None` if configuration hasn't been fetched yet. Holds `Some(Ok(()))` if configuration
    /// has been fetched successfully. Holds `Some(Err(...))` if the poller gave up before that.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    pub(crate) fn start(
        loader: Arc<ConfigurationLoader>,
        config: PollerThreadConfig,
    ) -> Result<PollerThread> {
        let (stop_sender, stop_receiver) = std::sync::mpsc::channel::<()>();

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                *result.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("decision-core-poller".to_owned())
                .spawn(move || loop {
                    match loader.refresh() {
                        Ok(outcome) => {
                            log::debug!(target: "decision_core",
                                        outcome:debug = outcome;
                                        "poller refreshed configuration");
                            if loader.configuration().is_some() {
                                update_result(Ok(()));
                            }
                        }
                        Err(Error::Unauthorized) => {
                            log::warn!(target: "decision_core",
                                       "client is not authorized, stopping the poller");
                            update_result(Err(Error::Unauthorized));
                            return;
                        }
                        Err(Error::Transport(err)) if !err.is_recoverable() => {
                            log::warn!(target: "decision_core",
                                       status = err.status;
                                       "unrecoverable error while fetching configuration, stopping the poller");
                            update_result(Err(Error::Transport(err)));
                            return;
                        }
                        Err(err) => {
                            // Retry on the next cycle.
                            log::warn!(target: "decision_core",
                                       "error while fetching configuration: {err}");
                        }
                    }

                    let timeout = jitter(config.interval, config.jitter);
                    match stop_receiver.recv_timeout(timeout) {
                        Err(RecvTimeoutError::Timeout) => {
                            // Timed out. Loop to fetch new configuration.
                        }
                        Ok(()) => {
                            log::debug!(target: "decision_core", "poller thread received stop command");
                            return;
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            // When the other end of channel disconnects, calls to
                            // .recv_timeout() return immediately. Use normal thread sleep in
                            // this case.
                            std::thread::sleep(timeout);
                        }
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Block waiting for the first configuration to get fetched.
    ///
    /// Returns the error that made the poller give up, if it did so before any configuration was
    /// available.
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Nothing to do then.
        let _ = self.stop_sender.send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Subtract a random jitter of at most `jitter` from `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    interval.saturating_sub(thread_rng().gen_range(Duration::ZERO..=jitter))
}
