//! Device watch channel.
//!
//! Two independent OS notification streams feed the daemon: one reports disks
//! whose description changed (a volume got mounted), the other reports USB
//! devices that were unplugged. [`WatchSession`] registers both with a
//! [`NotificationSource`], arms them by draining what is already pending, and
//! forwards normalized [`DeviceEvent`]s into a single channel from two
//! delivery threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::DeviceIdentity;
use crate::error::{Error, Result};
use crate::registry::{CandidateVolume, DiskDescriptor};

/// Changed-key name signalling that a disk's volume path was (re)assigned.
pub const KEY_VOLUME_PATH: &str = "volume_path";

/// How long a delivery thread blocks before re-checking the stop flag.
const DELIVERY_TICK: Duration = Duration::from_millis(200);

/// Which disks the arrival channel reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalRule {
    pub vendor_label: String,
    pub product_label: String,
    pub volume_mountable: bool,
    /// Description keys whose changes are reported.
    pub watched_keys: Vec<String>,
}

impl From<&DeviceIdentity> for ArrivalRule {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            vendor_label: identity.vendor_label.clone(),
            product_label: identity.product_label.clone(),
            volume_mountable: true,
            watched_keys: vec![KEY_VOLUME_PATH.to_string()],
        }
    }
}

/// Which USB devices the termination channel reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationRule {
    pub vendor_id: u16,
    pub product_id: u16,
}

impl From<&DeviceIdentity> for TerminationRule {
    fn from(identity: &DeviceIdentity) -> Self {
        Self {
            vendor_id: identity.vendor_id,
            product_id: identity.product_id,
        }
    }
}

/// Raw disk-description-changed notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArrivalNotice {
    pub descriptor: DiskDescriptor,
    pub changed_keys: Vec<String>,
}

/// A USB device instance that left the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TerminatedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Backend-specific instance name, e.g. a sysfs bus path.
    pub instance: String,
}

/// Event delivered to the presence state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceEvent {
    Arrived(CandidateVolume),
    Terminated(TerminatedDevice),
}

/// An armed notification registration.
pub trait Subscription<T>: Send {
    /// Waits up to `timeout` for the next notification.
    fn next_timeout(&mut self, timeout: Duration) -> Option<T>;

    /// Returns everything pending without blocking.
    ///
    /// Called once right after registration; a registration that is never
    /// drained may never fire.
    fn drain(&mut self) -> Vec<T>;

    /// Unregisters. Further calls return nothing.
    fn release(&mut self);
}

/// OS facility that hands out the two notification subscriptions.
pub trait NotificationSource {
    fn register_arrival(
        &mut self,
        rule: &ArrivalRule,
    ) -> Result<Box<dyn Subscription<ArrivalNotice>>>;

    fn register_termination(
        &mut self,
        rule: &TerminationRule,
    ) -> Result<Box<dyn Subscription<TerminatedDevice>>>;
}

/// Turns an arrival notice into a candidate volume.
///
/// Only notices reporting a volume path change, and carrying a volume path,
/// become events.
pub fn normalize_arrival(notice: ArrivalNotice) -> Option<CandidateVolume> {
    if !notice.changed_keys.iter().any(|k| k == KEY_VOLUME_PATH) {
        return None;
    }
    CandidateVolume::from_descriptor(notice.descriptor)
}

type ArrivalSub = Box<dyn Subscription<ArrivalNotice>>;
type TerminationSub = Box<dyn Subscription<TerminatedDevice>>;

/// Both notification channels, armed and delivering into one sink.
pub struct WatchSession {
    stop: Arc<AtomicBool>,
    arrival: Option<JoinHandle<Delivery<ArrivalNotice>>>,
    termination: Option<JoinHandle<Delivery<TerminatedDevice>>>,
}

impl WatchSession {
    /// Registers both channels for `identity` and starts delivery to `sink`.
    ///
    /// Notifications already pending at registration time are delivered
    /// first. If either registration fails, anything registered is released
    /// and [`Error::SubscriptionFailed`] is returned.
    pub fn open(
        identity: &DeviceIdentity,
        source: &mut dyn NotificationSource,
        sink: Sender<DeviceEvent>,
    ) -> Result<Self> {
        let mut arrival = source
            .register_arrival(&ArrivalRule::from(identity))
            .map_err(|e| subscription_failed("arrival", e))?;

        let mut termination = match source.register_termination(&TerminationRule::from(identity))
        {
            Ok(sub) => sub,
            Err(e) => {
                arrival.release();
                return Err(subscription_failed("termination", e));
            }
        };

        for notice in arrival.drain() {
            if let Some(volume) = normalize_arrival(notice) {
                debug!(volume = %volume.volume_name, "pending arrival at registration");
                if let Err(e) = sink.send(DeviceEvent::Arrived(volume)) {
                    debug!(event = ?e.0, "event consumer gone during arming");
                }
            }
        }
        for device in termination.drain() {
            debug!(instance = %device.instance, "pending termination at registration");
            if let Err(e) = sink.send(DeviceEvent::Terminated(device)) {
                debug!(event = ?e.0, "event consumer gone during arming");
            }
        }

        let stop = Arc::new(AtomicBool::new(false));

        let arrival = match spawn_delivery("arrival", arrival, stop.clone(), sink.clone(), |n| {
            normalize_arrival(n).map(DeviceEvent::Arrived)
        }) {
            Ok(handle) => handle,
            Err(e) => {
                termination.release();
                return Err(e);
            }
        };
        let termination = match spawn_delivery("termination", termination, stop.clone(), sink, |d| {
            Some(DeviceEvent::Terminated(d))
        }) {
            Ok(handle) => handle,
            Err(e) => {
                stop.store(true, Ordering::Release);
                if let Ok(delivery) = arrival.join() {
                    delivery.release();
                }
                return Err(e);
            }
        };

        info!(
            vendor_id = format_args!("{:#06x}", identity.vendor_id),
            product_id = format_args!("{:#06x}", identity.product_id),
            "device watch armed"
        );

        Ok(Self {
            stop,
            arrival: Some(arrival),
            termination: Some(termination),
        })
    }

    /// Returns true until [`close`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.arrival.is_some() || self.termination.is_some()
    }

    /// Stops delivery and unregisters both channels. Safe to call twice.
    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.arrival.take() {
            match handle.join() {
                Ok(delivery) => delivery.release(),
                Err(_) => warn!("arrival delivery thread panicked"),
            }
        }
        if let Some(handle) = self.termination.take() {
            match handle.join() {
                Ok(delivery) => delivery.release(),
                Err(_) => warn!("termination delivery thread panicked"),
            }
        }
        info!("device watch closed");
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn subscription_failed(channel: &str, source: Error) -> Error {
    match source {
        Error::SubscriptionFailed { .. } => source,
        other => Error::SubscriptionFailed {
            channel: channel.to_string(),
            message: other.to_string(),
        },
    }
}

/// A subscription owned by its delivery thread. Dropping it releases the
/// subscription, including when the thread could not be spawned.
struct Delivery<T: Send + 'static>(Option<Box<dyn Subscription<T>>>);

impl<T: Send + 'static> Delivery<T> {
    fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(mut sub) = self.0.take() {
            sub.release();
        }
    }
}

impl<T: Send + 'static> Drop for Delivery<T> {
    fn drop(&mut self) {
        self.release_now();
    }
}

fn spawn_delivery<T, F>(
    channel: &'static str,
    sub: Box<dyn Subscription<T>>,
    stop: Arc<AtomicBool>,
    sink: Sender<DeviceEvent>,
    convert: F,
) -> Result<JoinHandle<Delivery<T>>>
where
    T: Send + 'static,
    F: Fn(T) -> Option<DeviceEvent> + Send + 'static,
{
    let mut delivery = Delivery(Some(sub));
    thread::Builder::new()
        .name(format!("usbkey-{channel}"))
        .spawn(move || {
            if let Some(sub) = delivery.0.as_mut() {
                while !stop.load(Ordering::Acquire) {
                    let Some(notice) = sub.next_timeout(DELIVERY_TICK) else {
                        continue;
                    };
                    let Some(event) = convert(notice) else {
                        continue;
                    };
                    if sink.send(event).is_err() {
                        debug!(channel, "event consumer gone; stopping delivery");
                        break;
                    }
                }
            }
            delivery
        })
        .map_err(|e| Error::SubscriptionFailed {
            channel: channel.to_string(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::mpsc::{self, Receiver};

    #[derive(Default)]
    struct Log {
        released: Vec<&'static str>,
    }

    struct QueueSub<T> {
        name: &'static str,
        pending: VecDeque<T>,
        live: Option<Receiver<T>>,
        log: Arc<Mutex<Log>>,
    }

    impl<T: Send> Subscription<T> for QueueSub<T> {
        fn next_timeout(&mut self, timeout: Duration) -> Option<T> {
            match &self.live {
                Some(rx) => rx.recv_timeout(timeout).ok(),
                None => {
                    thread::sleep(timeout);
                    None
                }
            }
        }

        fn drain(&mut self) -> Vec<T> {
            self.pending.drain(..).collect()
        }

        fn release(&mut self) {
            self.live = None;
            self.log.lock().unwrap().released.push(self.name);
        }
    }

    struct FakeSource {
        initial_arrivals: Vec<ArrivalNotice>,
        arrivals: Option<Receiver<ArrivalNotice>>,
        terminations: Option<Receiver<TerminatedDevice>>,
        fail_termination: bool,
        log: Arc<Mutex<Log>>,
    }

    impl NotificationSource for FakeSource {
        fn register_arrival(&mut self, _rule: &ArrivalRule) -> Result<ArrivalSub> {
            Ok(Box::new(QueueSub {
                name: "arrival",
                pending: self.initial_arrivals.drain(..).collect(),
                live: self.arrivals.take(),
                log: self.log.clone(),
            }))
        }

        fn register_termination(&mut self, _rule: &TerminationRule) -> Result<TerminationSub> {
            if self.fail_termination {
                snafu::whatever!("no usb notification port");
            }
            Ok(Box::new(QueueSub {
                name: "termination",
                pending: VecDeque::new(),
                live: self.terminations.take(),
                log: self.log.clone(),
            }))
        }
    }

    fn notice(mount: Option<&str>, keys: &[&str]) -> ArrivalNotice {
        ArrivalNotice {
            descriptor: DiskDescriptor {
                device_node: PathBuf::from("/dev/sdb1"),
                whole_disk: Some(PathBuf::from("/dev/sdb")),
                vendor_id: Some(0x0781),
                product_id: Some(0x5571),
                vendor_label: Some("SanDisk".into()),
                product_label: Some("Cruzer Fit".into()),
                volume_mountable: true,
                volume_path: mount.map(PathBuf::from),
                volume_name: Some("KEY".into()),
            },
            changed_keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn test_normalize_requires_volume_path_key() {
        assert!(normalize_arrival(notice(Some("/media/KEY"), &["volume_path"])).is_some());
        assert!(normalize_arrival(notice(Some("/media/KEY"), &["media_name"])).is_none());
        assert!(normalize_arrival(notice(None, &["volume_path"])).is_none());
    }

    #[test]
    fn test_rules_follow_identity() {
        let identity = DeviceIdentity::default();
        let arrival = ArrivalRule::from(&identity);
        assert_eq!(arrival.vendor_label, "SanDisk");
        assert!(arrival.volume_mountable);
        let termination = TerminationRule::from(&identity);
        assert_eq!(termination.vendor_id, 0x0781);
        assert_eq!(termination.product_id, 0x5571);
    }

    #[test]
    fn test_open_delivers_pending_then_live_events() {
        let log = Arc::new(Mutex::new(Log::default()));
        let (arrival_tx, arrival_rx) = mpsc::channel();
        let (term_tx, term_rx) = mpsc::channel();
        let mut source = FakeSource {
            initial_arrivals: vec![notice(Some("/media/KEY"), &[KEY_VOLUME_PATH])],
            arrivals: Some(arrival_rx),
            terminations: Some(term_rx),
            fail_termination: false,
            log: log.clone(),
        };

        let (tx, rx) = mpsc::channel();
        let mut session = WatchSession::open(&DeviceIdentity::default(), &mut source, tx).unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            DeviceEvent::Arrived(vol) => assert_eq!(vol.mount_path, PathBuf::from("/media/KEY")),
            other => panic!("unexpected {other:?}"),
        }

        arrival_tx.send(notice(None, &[KEY_VOLUME_PATH])).unwrap();
        term_tx
            .send(TerminatedDevice {
                vendor_id: 0x0781,
                product_id: 0x5571,
                instance: "1-1".into(),
            })
            .unwrap();

        match rx.recv_timeout(Duration::from_secs(2)).unwrap() {
            DeviceEvent::Terminated(dev) => assert_eq!(dev.instance, "1-1"),
            other => panic!("unexpected {other:?}"),
        }

        session.close();
        session.close();
        assert!(!session.is_open());
        let released = log.lock().unwrap().released.clone();
        assert_eq!(released, vec!["arrival", "termination"]);
    }

    #[test]
    fn test_failed_termination_releases_arrival() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut source = FakeSource {
            initial_arrivals: Vec::new(),
            arrivals: None,
            terminations: None,
            fail_termination: true,
            log: log.clone(),
        };
        let (tx, _rx) = mpsc::channel();
        let err = match WatchSession::open(&DeviceIdentity::default(), &mut source, tx) {
            Ok(_) => panic!("open should fail"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), "subscription_failed");
        assert!(err.to_string().contains("termination"));
        assert_eq!(log.lock().unwrap().released, vec!["arrival"]);
    }

    #[test]
    fn test_undelivered_subscription_is_released_on_drop() {
        let log = Arc::new(Mutex::new(Log::default()));
        let sub: TerminationSub = Box::new(QueueSub {
            name: "termination",
            pending: VecDeque::new(),
            live: None,
            log: log.clone(),
        });
        drop(Delivery(Some(sub)));
        assert_eq!(log.lock().unwrap().released, vec!["termination"]);
    }

    #[test]
    fn test_arming_with_consumer_gone_still_opens() {
        let log = Arc::new(Mutex::new(Log::default()));
        let mut source = FakeSource {
            initial_arrivals: vec![notice(Some("/media/KEY"), &[KEY_VOLUME_PATH])],
            arrivals: None,
            terminations: None,
            fail_termination: false,
            log: log.clone(),
        };
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let mut session = WatchSession::open(&DeviceIdentity::default(), &mut source, tx).unwrap();
        session.close();
        assert_eq!(log.lock().unwrap().released, vec!["arrival", "termination"]);
    }
}
