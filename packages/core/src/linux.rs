//! udev notification backend for Linux.
//!
//! Arrivals come from the `block` subsystem: a matching USB partition that
//! has a mount point produces a notice with the volume-path key. udev has no
//! mount events, so a partition seen unmounted is rechecked through lsblk
//! until it is mounted or removed. Terminations come from the `usb`
//! subsystem, keyed by `idVendor`/`idProduct`.
//!
//! Each channel owns a listener thread holding the udev monitor socket. The
//! thread only forwards [`Uevent`] snapshots; matching happens in the
//! subscription, so it can be exercised without a running udev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use snafu::ResultExt;
use tracing::{debug, trace, warn};
use udev::{Device, Enumerator, MonitorBuilder};

use crate::disk;
use crate::error::{DeviceMonitorSnafu, Result};
use crate::registry::DiskDescriptor;
use crate::watch::{
    ArrivalNotice, ArrivalRule, KEY_VOLUME_PATH, NotificationSource, Subscription,
    TerminatedDevice, TerminationRule,
};

/// Sleep between empty reads of the non-blocking monitor socket.
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Resolves the mount point of a partition device node.
pub type MountLookup = Arc<dyn Fn(&Path) -> Option<PathBuf> + Send + Sync>;

/// [`NotificationSource`] backed by udev monitors.
#[derive(Clone)]
pub struct UdevSource {
    mount_recheck: Duration,
    mount_of: MountLookup,
}

impl UdevSource {
    /// `mount_recheck` is how often an unmounted token partition is looked up
    /// again.
    pub fn new(mount_recheck: Duration) -> Self {
        Self {
            mount_recheck,
            mount_of: Arc::new(lsblk_mountpoint),
        }
    }

    /// Replaces the lsblk mount lookup.
    pub fn with_mount_lookup(mut self, lookup: MountLookup) -> Self {
        self.mount_of = lookup;
        self
    }
}

fn lsblk_mountpoint(devnode: &Path) -> Option<PathBuf> {
    match disk::mountpoint_of(devnode) {
        Ok(mountpoint) => mountpoint,
        Err(e) => {
            warn!(device = %devnode.display(), error = %e, "mount lookup failed");
            None
        }
    }
}

impl NotificationSource for UdevSource {
    fn register_arrival(
        &mut self,
        rule: &ArrivalRule,
    ) -> Result<Box<dyn Subscription<ArrivalNotice>>> {
        // Listen first so nothing slips between the scan and the monitor.
        let feed = UdevFeed::listen("usbkey-udev-block", "block", "partition")?;
        let mut sub = UdevArrivals::new(
            feed,
            ArrivalTracker::new(rule.clone(), self.mount_of.clone()),
            self.mount_recheck,
        );
        for event in scan("block", |e| {
            e.match_property("DEVTYPE", "partition")?;
            e.match_property("ID_BUS", "usb")
        })? {
            sub.tracker.absorb(event);
        }
        debug!(pending = sub.tracker.pending.len(), "udev block monitor registered");
        Ok(Box::new(sub))
    }

    fn register_termination(
        &mut self,
        rule: &TerminationRule,
    ) -> Result<Box<dyn Subscription<TerminatedDevice>>> {
        let feed = UdevFeed::listen("usbkey-udev-usb", "usb", "usb_device")?;
        let mut sub = UdevTerminations::new(feed, TerminationTracker::new(*rule));
        let vendor = format!("{:04x}", rule.vendor_id);
        let product = format!("{:04x}", rule.product_id);
        for event in scan("usb", |e| {
            e.match_attribute("idVendor", &vendor)?;
            e.match_attribute("idProduct", &product)
        })? {
            sub.tracker.absorb(event);
        }
        debug!(present = sub.tracker.present.len(), "udev usb monitor registered");
        Ok(Box::new(sub))
    }
}

/// Enumerates devices already present, reported as `add` events.
fn scan(
    subsystem: &str,
    filter: impl FnOnce(&mut Enumerator) -> std::io::Result<()>,
) -> Result<Vec<Uevent>> {
    let enumerate = || -> std::io::Result<Vec<Uevent>> {
        let mut enumerator = Enumerator::new()?;
        enumerator.match_subsystem(subsystem)?;
        filter(&mut enumerator)?;
        Ok(enumerator
            .scan_devices()?
            .map(|device| {
                let mut event = Uevent::from_device(&device);
                event.action = "add".to_string();
                event
            })
            .collect())
    };
    enumerate().context(DeviceMonitorSnafu { subsystem })
}

/// A udev device event reduced to owned strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Uevent {
    /// `add`, `change`, `remove`, `bind` or `unbind`.
    pub action: String,
    /// Kernel name, e.g. "sdb1" or "1-1".
    pub sysname: String,
    pub properties: HashMap<String, String>,
    /// `idVendor`/`idProduct` sysfs attributes, when readable.
    pub attributes: HashMap<String, String>,
    /// Device node of the whole disk, for partitions.
    pub parent_node: Option<PathBuf>,
}

impl Uevent {
    fn from_device(device: &Device) -> Self {
        let properties = device
            .properties()
            .map(|entry| {
                (
                    entry.name().to_string_lossy().into_owned(),
                    entry.value().to_string_lossy().into_owned(),
                )
            })
            .collect();
        let attributes = ["idVendor", "idProduct"]
            .into_iter()
            .filter_map(|name| {
                device
                    .attribute_value(name)
                    .and_then(os_str_to_str)
                    .map(|value| (name.to_string(), value.trim().to_string()))
            })
            .collect();
        let parent_node = device
            .parent_with_subsystem_devtype("block", "disk")
            .ok()
            .flatten()
            .and_then(|parent| parent.devnode().map(Path::to_path_buf));
        Self {
            // Enumerated devices carry no action.
            action: device
                .action()
                .and_then(os_str_to_str)
                .unwrap_or("change")
                .to_string(),
            sysname: device.sysname().to_string_lossy().into_owned(),
            properties,
            attributes,
            parent_node,
        }
    }

    fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn devnode(&self) -> Option<PathBuf> {
        self.property("DEVNAME").map(PathBuf::from)
    }

    /// Vendor string as the drive reports it, e.g. "SanDisk".
    fn vendor_label(&self) -> Option<String> {
        label(self.property("ID_VENDOR_ENC"), self.property("ID_VENDOR"))
    }

    /// Model string as the drive reports it, e.g. "Cruzer Fit".
    fn product_label(&self) -> Option<String> {
        label(self.property("ID_MODEL_ENC"), self.property("ID_MODEL"))
    }

    fn usb_ids(&self) -> Option<(u16, u16)> {
        if let (Some(vendor), Some(product)) = (
            self.attributes.get("idVendor"),
            self.attributes.get("idProduct"),
        ) {
            return Some((parse_hex(vendor)?, parse_hex(product)?));
        }
        if let (Some(vendor), Some(product)) =
            (self.property("ID_VENDOR_ID"), self.property("ID_MODEL_ID"))
        {
            return Some((parse_hex(vendor)?, parse_hex(product)?));
        }
        // Removal events only carry PRODUCT, e.g. "781/5571/100".
        let mut product = self.property("PRODUCT")?.split('/');
        Some((parse_hex(product.next()?)?, parse_hex(product.next()?)?))
    }
}

fn os_str_to_str(value: &OsStr) -> Option<&str> {
    value.to_str()
}

fn parse_hex(raw: &str) -> Option<u16> {
    u16::from_str_radix(raw.trim(), 16).ok()
}

/// Prefers the `\xNN`-encoded raw string; the plain property has spaces
/// replaced by underscores.
fn label(encoded: Option<&str>, plain: Option<&str>) -> Option<String> {
    let decoded = match encoded {
        Some(raw) => unescape_hex(raw),
        None => plain?.replace('_', " "),
    };
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn unescape_hex(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find("\\x") {
        output.push_str(&rest[..pos]);
        let code = rest
            .get(pos + 2..pos + 4)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match code {
            Some(byte) => {
                output.push(byte as char);
                rest = &rest[pos + 4..];
            }
            None => {
                output.push_str("\\x");
                rest = &rest[pos + 2..];
            }
        }
    }
    output.push_str(rest);
    output
}

/// Listener thread forwarding one udev monitor into a channel.
struct UdevFeed {
    events: Receiver<Uevent>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UdevFeed {
    /// Opens a monitor for `subsystem`/`devtype` on a new thread and waits
    /// until it is listening.
    fn listen(name: &str, subsystem: &'static str, devtype: &'static str) -> Result<Self> {
        let (tx, events) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        let worker = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let opened = MonitorBuilder::new()
                    .and_then(|b| b.match_subsystem_devtype(subsystem, devtype))
                    .and_then(|b| b.listen());
                let socket = match opened {
                    Ok(socket) => {
                        let _ = ready_tx.send(Ok(()));
                        socket
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !flag.load(Ordering::Acquire) {
                    match socket.iter().next() {
                        Some(event) => {
                            let uevent = Uevent::from_device(&event.device());
                            trace!(subsystem, action = %uevent.action, device = %uevent.sysname, "uevent");
                            if tx.send(uevent).is_err() {
                                break;
                            }
                        }
                        None => thread::sleep(IDLE_SLEEP),
                    }
                }
            })
            .context(DeviceMonitorSnafu { subsystem })?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(std::io::Error::other(
                "udev listener exited before it was ready",
            ))
        });
        match ready {
            Ok(()) => Ok(Self {
                events,
                stop,
                worker: Some(worker),
            }),
            Err(e) => {
                let _ = worker.join();
                Err(e).context(DeviceMonitorSnafu { subsystem })
            }
        }
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for UdevFeed {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Feeds events into `state` until `ready` yields something or `timeout`
/// passes. `tick` runs whenever `every` elapses without an event.
fn next_from<S, T>(
    events: &Receiver<Uevent>,
    state: &mut S,
    timeout: Duration,
    every: Duration,
    absorb: fn(&mut S, Uevent),
    tick: fn(&mut S),
    ready: fn(&mut S) -> Option<T>,
) -> Option<T> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(item) = ready(state) {
            return Some(item);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        match events.recv_timeout((deadline - now).min(every)) {
            Ok(event) => absorb(state, event),
            Err(RecvTimeoutError::Timeout) => tick(state),
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(deadline.saturating_duration_since(Instant::now()));
                return ready(state);
            }
        }
    }
}

/// Tracks matching partitions and turns mount point changes into notices.
struct ArrivalTracker {
    rule: ArrivalRule,
    mount_of: MountLookup,
    /// Matching partitions by device node, with the last known mount point.
    known: HashMap<PathBuf, (Uevent, Option<PathBuf>)>,
    pending: VecDeque<ArrivalNotice>,
}

impl ArrivalTracker {
    fn new(rule: ArrivalRule, mount_of: MountLookup) -> Self {
        Self {
            rule,
            mount_of,
            known: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    fn matches(&self, event: &Uevent) -> bool {
        event.property("DEVTYPE") == Some("partition")
            && event.property("ID_BUS") == Some("usb")
            && event.vendor_label().as_deref() == Some(self.rule.vendor_label.as_str())
            && event.product_label().as_deref() == Some(self.rule.product_label.as_str())
            && is_mountable(event) == self.rule.volume_mountable
    }

    fn absorb(&mut self, event: Uevent) {
        if !self.rule.watched_keys.iter().any(|k| k == KEY_VOLUME_PATH) {
            return;
        }
        let Some(node) = event.devnode() else {
            return;
        };
        match event.action.as_str() {
            "add" | "change" | "bind" => {
                if !self.matches(&event) {
                    return;
                }
                let previous = self.known.remove(&node).and_then(|(_, mount)| mount);
                self.known.insert(node.clone(), (event, previous));
                self.refresh(&node);
            }
            "remove" | "unbind" => {
                if self.known.remove(&node).is_some() {
                    debug!(device = %node.display(), "token partition removed");
                }
            }
            _ => {}
        }
    }

    /// Re-reads the mount point of `node` and queues a notice if it moved to
    /// a new path.
    fn refresh(&mut self, node: &Path) {
        let current = (self.mount_of)(node);
        let Some((event, last)) = self.known.get_mut(node) else {
            return;
        };
        if *last == current {
            return;
        }
        *last = current.clone();
        if current.is_none() {
            return;
        }
        trace!(device = %node.display(), mountpoint = ?current, "volume path changed");
        let descriptor = describe(event, node, current);
        self.pending.push_back(ArrivalNotice {
            descriptor,
            changed_keys: vec![KEY_VOLUME_PATH.to_string()],
        });
    }

    fn refresh_all(&mut self) {
        let nodes: Vec<PathBuf> = self.known.keys().cloned().collect();
        for node in nodes {
            self.refresh(&node);
        }
    }

    fn pop(&mut self) -> Option<ArrivalNotice> {
        self.pending.pop_front()
    }
}

fn is_mountable(event: &Uevent) -> bool {
    event.property("ID_FS_USAGE") == Some("filesystem")
}

fn describe(event: &Uevent, node: &Path, mountpoint: Option<PathBuf>) -> DiskDescriptor {
    let ids = event.usb_ids();
    DiskDescriptor {
        device_node: node.to_path_buf(),
        whole_disk: event.parent_node.clone(),
        vendor_id: ids.map(|(vendor, _)| vendor),
        product_id: ids.map(|(_, product)| product),
        vendor_label: event.vendor_label(),
        product_label: event.product_label(),
        volume_mountable: is_mountable(event),
        volume_path: mountpoint,
        volume_name: Some(
            label(
                event.property("ID_FS_LABEL_ENC"),
                event.property("ID_FS_LABEL"),
            )
            .unwrap_or_else(|| event.sysname.clone()),
        ),
    }
}

struct UdevArrivals {
    feed: UdevFeed,
    tracker: ArrivalTracker,
    mount_recheck: Duration,
    released: bool,
}

impl UdevArrivals {
    fn new(feed: UdevFeed, tracker: ArrivalTracker, mount_recheck: Duration) -> Self {
        Self {
            feed,
            tracker,
            mount_recheck,
            released: false,
        }
    }
}

impl Subscription<ArrivalNotice> for UdevArrivals {
    fn next_timeout(&mut self, timeout: Duration) -> Option<ArrivalNotice> {
        if self.released {
            return None;
        }
        next_from(
            &self.feed.events,
            &mut self.tracker,
            timeout,
            self.mount_recheck,
            ArrivalTracker::absorb,
            ArrivalTracker::refresh_all,
            ArrivalTracker::pop,
        )
    }

    fn drain(&mut self) -> Vec<ArrivalNotice> {
        self.tracker.pending.drain(..).collect()
    }

    fn release(&mut self) {
        self.released = true;
        self.feed.shutdown();
        self.tracker.pending.clear();
        self.tracker.known.clear();
    }
}

/// Tracks instances of the token on the USB bus and reports their removal.
struct TerminationTracker {
    rule: TerminationRule,
    present: HashSet<String>,
    pending: VecDeque<TerminatedDevice>,
}

impl TerminationTracker {
    fn new(rule: TerminationRule) -> Self {
        Self {
            rule,
            present: HashSet::new(),
            pending: VecDeque::new(),
        }
    }

    fn matches(&self, event: &Uevent) -> bool {
        event.usb_ids() == Some((self.rule.vendor_id, self.rule.product_id))
    }

    fn absorb(&mut self, event: Uevent) {
        if event.property("DEVTYPE").is_some_and(|t| t != "usb_device") {
            return;
        }
        match event.action.as_str() {
            "add" | "bind" | "change" => {
                if self.matches(&event) {
                    self.present.insert(event.sysname);
                }
            }
            // Driver unbind precedes removal and is not a removal itself.
            "remove" => {
                let known = self.present.remove(&event.sysname);
                if known || self.matches(&event) {
                    debug!(instance = %event.sysname, "usb device removed");
                    self.pending.push_back(TerminatedDevice {
                        vendor_id: self.rule.vendor_id,
                        product_id: self.rule.product_id,
                        instance: event.sysname,
                    });
                }
            }
            _ => {}
        }
    }

    fn idle(&mut self) {}

    fn pop(&mut self) -> Option<TerminatedDevice> {
        self.pending.pop_front()
    }
}

struct UdevTerminations {
    feed: UdevFeed,
    tracker: TerminationTracker,
    released: bool,
}

impl UdevTerminations {
    fn new(feed: UdevFeed, tracker: TerminationTracker) -> Self {
        Self {
            feed,
            tracker,
            released: false,
        }
    }
}

impl Subscription<TerminatedDevice> for UdevTerminations {
    fn next_timeout(&mut self, timeout: Duration) -> Option<TerminatedDevice> {
        if self.released {
            return None;
        }
        next_from(
            &self.feed.events,
            &mut self.tracker,
            timeout,
            timeout,
            TerminationTracker::absorb,
            TerminationTracker::idle,
            TerminationTracker::pop,
        )
    }

    fn drain(&mut self) -> Vec<TerminatedDevice> {
        self.tracker.pending.drain(..).collect()
    }

    fn release(&mut self) {
        self.released = true;
        self.feed.shutdown();
        self.tracker.pending.clear();
        self.tracker.present.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceIdentity;
    use std::sync::Mutex;
    use std::sync::mpsc::Sender;

    type Mounts = Arc<Mutex<HashMap<PathBuf, PathBuf>>>;

    fn fake_feed() -> (Sender<Uevent>, UdevFeed) {
        let (tx, events) = mpsc::channel();
        let feed = UdevFeed {
            events,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        };
        (tx, feed)
    }

    fn uevent(action: &str, sysname: &str, props: &[(&str, &str)]) -> Uevent {
        Uevent {
            action: action.to_string(),
            sysname: sysname.to_string(),
            properties: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn key_partition(action: &str) -> Uevent {
        let mut event = uevent(
            action,
            "sdb1",
            &[
                ("DEVNAME", "/dev/sdb1"),
                ("DEVTYPE", "partition"),
                ("ID_BUS", "usb"),
                ("ID_VENDOR", "SanDisk"),
                ("ID_VENDOR_ENC", "SanDisk\\x20"),
                ("ID_MODEL", "Cruzer_Fit"),
                ("ID_MODEL_ENC", "Cruzer\\x20Fit\\x20\\x20\\x20\\x20\\x20\\x20"),
                ("ID_VENDOR_ID", "0781"),
                ("ID_MODEL_ID", "5571"),
                ("ID_FS_USAGE", "filesystem"),
                ("ID_FS_TYPE", "exfat"),
                ("ID_FS_LABEL", "KEY"),
            ],
        );
        event.parent_node = Some(PathBuf::from("/dev/sdb"));
        event
    }

    fn token_usb(action: &str, instance: &str) -> Uevent {
        let mut event = uevent(
            action,
            instance,
            &[("DEVTYPE", "usb_device"), ("PRODUCT", "781/5571/100")],
        );
        if action != "remove" {
            event.attributes.insert("idVendor".into(), "0781".into());
            event.attributes.insert("idProduct".into(), "5571".into());
        }
        event
    }

    fn mounted_key() -> Mounts {
        Arc::new(Mutex::new(HashMap::from([(
            PathBuf::from("/dev/sdb1"),
            PathBuf::from("/run/media/u/KEY"),
        )])))
    }

    fn arrivals(mounts: Mounts) -> (Sender<Uevent>, UdevArrivals) {
        let (tx, feed) = fake_feed();
        let lookup: MountLookup =
            Arc::new(move |node: &Path| mounts.lock().unwrap().get(node).cloned());
        let tracker = ArrivalTracker::new(ArrivalRule::from(&DeviceIdentity::default()), lookup);
        (tx, UdevArrivals::new(feed, tracker, Duration::from_millis(10)))
    }

    fn terminations() -> (Sender<Uevent>, UdevTerminations) {
        let (tx, feed) = fake_feed();
        let tracker = TerminationTracker::new(TerminationRule::from(&DeviceIdentity::default()));
        (tx, UdevTerminations::new(feed, tracker))
    }

    #[test]
    fn test_labels_decode_udev_escapes() {
        assert_eq!(unescape_hex("Cruzer\\x20Fit"), "Cruzer Fit");
        assert_eq!(unescape_hex("bad\\xZZ"), "bad\\xZZ");
        assert_eq!(label(None, Some("Cruzer_Fit")), Some("Cruzer Fit".to_string()));
        assert_eq!(label(Some("\\x20\\x20"), None), None);
    }

    #[test]
    fn test_mounted_key_is_pending_after_scan() {
        let (_tx, mut sub) = arrivals(mounted_key());
        sub.tracker.absorb(key_partition("add"));

        let pending = sub.drain();
        assert_eq!(pending.len(), 1);
        let descriptor = &pending[0].descriptor;
        assert_eq!(descriptor.vendor_id, Some(0x0781));
        assert_eq!(descriptor.product_id, Some(0x5571));
        assert_eq!(descriptor.vendor_label.as_deref(), Some("SanDisk"));
        assert_eq!(descriptor.product_label.as_deref(), Some("Cruzer Fit"));
        assert_eq!(descriptor.whole_disk, Some(PathBuf::from("/dev/sdb")));
        assert_eq!(descriptor.volume_name.as_deref(), Some("KEY"));
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_mount_after_add_is_reported_once() {
        let mounts: Mounts = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut sub) = arrivals(mounts.clone());

        tx.send(key_partition("add")).unwrap();
        assert!(sub.next_timeout(Duration::from_millis(40)).is_none());

        mounts.lock().unwrap().insert(
            PathBuf::from("/dev/sdb1"),
            PathBuf::from("/run/media/u/KEY"),
        );
        let notice = sub.next_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(
            notice.descriptor.volume_path,
            Some(PathBuf::from("/run/media/u/KEY"))
        );

        tx.send(key_partition("change")).unwrap();
        assert!(sub.next_timeout(Duration::from_millis(40)).is_none());
    }

    #[test]
    fn test_other_vendor_is_ignored() {
        let (_tx, mut sub) = arrivals(mounted_key());
        let mut other = key_partition("add");
        other
            .properties
            .insert("ID_VENDOR_ENC".into(), "Kingston".into());
        sub.tracker.absorb(other);
        assert!(sub.drain().is_empty());
        assert!(sub.tracker.known.is_empty());
    }

    #[test]
    fn test_replug_is_a_new_arrival() {
        let (tx, mut sub) = arrivals(mounted_key());

        tx.send(key_partition("add")).unwrap();
        assert!(sub.next_timeout(Duration::from_millis(100)).is_some());
        tx.send(key_partition("remove")).unwrap();
        tx.send(key_partition("add")).unwrap();
        assert!(sub.next_timeout(Duration::from_millis(100)).is_some());
    }

    #[test]
    fn test_unplug_reports_matching_instance() {
        let (tx, mut sub) = terminations();
        sub.tracker.absorb(token_usb("add", "1-1"));
        assert!(sub.drain().is_empty());

        // Unplugging the mouse is not reported.
        tx.send(uevent(
            "remove",
            "1-2",
            &[("DEVTYPE", "usb_device"), ("PRODUCT", "46d/c52b/1201")],
        ))
        .unwrap();
        tx.send(token_usb("unbind", "1-1")).unwrap();
        assert!(sub.next_timeout(Duration::from_millis(30)).is_none());

        tx.send(token_usb("remove", "1-1")).unwrap();
        let gone = sub.next_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(gone.instance, "1-1");
        assert_eq!(gone.vendor_id, 0x0781);
        assert_eq!(gone.product_id, 0x5571);

        sub.release();
        assert!(sub.next_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_quick_replug_still_reports_removal() {
        let (tx, mut sub) = terminations();
        sub.tracker.absorb(token_usb("add", "1-1"));

        // Pulled and plugged back before anyone reads the channel.
        tx.send(token_usb("remove", "1-1")).unwrap();
        tx.send(token_usb("add", "1-1")).unwrap();

        let gone = sub.next_timeout(Duration::from_millis(200)).unwrap();
        assert_eq!(gone.instance, "1-1");
        assert!(sub.next_timeout(Duration::from_millis(30)).is_none());
        assert!(sub.tracker.present.contains("1-1"));
    }

    #[test]
    fn test_removal_of_unseen_token_uses_product_property() {
        let (_tx, mut sub) = terminations();
        sub.tracker.absorb(token_usb("remove", "2-3"));
        let pending = sub.drain();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].instance, "2-3");
    }
}
