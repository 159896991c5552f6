use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::select;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

/// A channel as the keepalive scheduler sees it
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Pingable: Send + Sync + 'static {
    /// true if nothing was sent since the previous ping cycle
    fn needs_ping(&self) -> bool;
    fn enable_ping(&self);
    /// pinging is suspended after a failed ping until the channel is reconnected
    fn is_ping_suspended(&self) -> bool;
    /// Send a ping, handling any failure inside the channel
    async fn send_ping(&self);
}

struct Registration {
    channel: Weak<dyn Pingable>,
    interval: Duration,
    next_due: Instant,
}

struct PingerState {
    channels: FxHashMap<u64, Registration>,
    task: Option<(JoinHandle<()>, watch::Sender<bool>)>,
}

impl PingerState {
    fn next_due(&self) -> Option<Instant> {
        self.channels.values()
            .map(|r| r.next_due)
            .min()
    }

    /// The live channels whose ping cycle is due, scheduling their next cycle
    fn take_due(&mut self, now: Instant) -> Vec<Arc<dyn Pingable>> {
        self.channels.values_mut()
            .filter(|r| r.next_due <= now)
            .filter_map(|r| {
                r.next_due = now + r.interval;
                r.channel.upgrade()
            })
            .collect()
    }
}

/// One keepalive scheduler shared by all channels of an environment. Every channel is checked at
///  its own interval.
///
/// The background task is started when the first channel registers, and stopped when the last
///  channel deregisters.
pub struct Pinger {
    state: Arc<Mutex<PingerState>>,
    registered: Arc<Notify>,
}

impl Default for Pinger {
    fn default() -> Self {
        Pinger::new()
    }
}

impl Pinger {
    pub fn new() -> Pinger {
        Pinger {
            state: Arc::new(Mutex::new(PingerState {
                channels: Default::default(),
                task: None,
            })),
            registered: Arc::new(Notify::new()),
        }
    }

    /// Register a channel, replacing an earlier registration with the same id. Its first ping
    ///  cycle is one interval from now.
    pub async fn register(&self, id: u64, channel: Weak<dyn Pingable>, interval: Duration) {
        let mut state = self.state.lock().await;
        state.channels.insert(id, Registration {
            channel,
            interval,
            next_due: Instant::now() + interval,
        });

        if state.task.is_none() {
            debug!("starting pinger");
            let (stop, stop_rx) = watch::channel(false);
            let handle = tokio::spawn(ping_loop(Arc::downgrade(&self.state), self.registered.clone(), stop_rx));
            state.task = Some((handle, stop));
        }
        else {
            self.registered.notify_one();
        }
    }

    pub async fn deregister(&self, id: u64) {
        let mut state = self.state.lock().await;
        if state.channels.remove(&id).is_none() {
            trace!("channel {} was not registered with the pinger", id);
        }

        if state.channels.is_empty() {
            if let Some((_handle, stop)) = state.task.take() {
                debug!("no channels left, stopping pinger");
                stop.send_replace(true);
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.task.is_some()
    }

    pub async fn num_registered(&self) -> usize {
        self.state.lock().await.channels.len()
    }
}

async fn ping_loop(state: Weak<Mutex<PingerState>>, registered: Arc<Notify>, mut stop: watch::Receiver<bool>) {
    loop {
        let next_due = match state.upgrade() {
            Some(state) => state.lock().await.next_due(),
            None => break,
        };
        let due = async {
            match next_due {
                Some(deadline) => time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        select! {
            biased;
            _ = stop.wait_for(|s| *s) => break,
            // a new registration may be due earlier
            _ = registered.notified() => continue,
            _ = due => {}
        }

        let channels = match state.upgrade() {
            Some(state) => state.lock().await.take_due(Instant::now()),
            None => break,
        };

        trace!("ping cycle for {} channels", channels.len());
        for channel in channels {
            if *stop.borrow() {
                break;
            }
            if channel.is_ping_suspended() {
                continue;
            }
            if channel.needs_ping() {
                channel.send_ping().await;
            }
            else {
                channel.enable_ping();
            }
        }
    }
    debug!("pinger stopped");
}
