//! Per-name peer tracking.
//!
//! For every bus name the daemon talks to, a per-name state machine resolves
//! who is actually speaking, in OS terms: connection name, unique owner,
//! process id, effective uid/gid, and, when the immediate owner turns out to
//! be a sandbox proxy, the identity behind it. Consumers subscribe to
//! liveness transitions; the dispatcher parks privileged calls here until
//! the sender's identity is known.
//!
//! All state lives behind one short-section mutex. Transitions collect their
//! side effects as actions under the lock and execute them after release,
//! so subscriber callbacks are free to reenter the registry.

pub mod identity;

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use tokio::{sync::mpsc, task::AbortHandle};
use tracing::{debug, info, trace, warn};
use zbus::{
    fdo::DBusProxy,
    message::{Message, Type as MessageType},
    zvariant::{OwnedValue, Value as Variant},
    Connection, MatchRule, OwnedMatchRule,
};

use crate::{
    bus::send::{self, ReplyOutcome},
    datapipe::{Liveness, Topic},
    slots::SlotList,
    wakelock::WakelockHub,
};

pub use identity::{Privilege, PrivilegedIds};

const DBUS_NAME: &str = "org.freedesktop.DBus";
const DBUS_PATH: &str = "/org/freedesktop/DBus";
const DBUS_INTERFACE: &str = "org.freedesktop.DBus";
const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";

/// Relay binary whose pid is not the one we are after.
pub const SANDBOX_PROXY_BINARY: &str = "/usr/bin/xdg-dbus-proxy";
/// Interface served by the sandbox launcher for unmasking the real client.
pub const IDENTIFY_INTERFACE: &str = "org.sailfishos.sailjailed";
const IDENTIFY_MEMBER: &str = "Identify";

/// Grace window before a stopped private name is dropped from the registry.
pub const DEFAULT_DELETE_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Initial,
    QueryOwner,
    QueryPid,
    Identify,
    Running,
    Stopped,
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "INITIAL",
            Self::QueryOwner => "QUERY_OWNER",
            Self::QueryPid => "QUERY_PID",
            Self::Identify => "IDENTIFY",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
        };
        f.write_str(s)
    }
}

/// Shape of a `NameOwnerChanged` notification, also synthesized for quit
/// subscribers with an empty new owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerChange {
    pub name: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Fired exactly once when the peer is observed to have left the bus.
pub type QuitHandler = Arc<dyn Fn(&OwnerChange) + Send + Sync>;

/// Fired on every state transition, and once shortly after subscribing.
pub type StateHandler = Arc<dyn Fn(&str, PeerState) + Send + Sync>;

/// One outstanding piece of async work. The sequence number outlives the
/// task: a reply carrying a stale sequence is discarded, so cancellation
/// guarantees no late callback even if the abort races delivery.
#[derive(Debug)]
struct Pending {
    seq: u64,
    abort: Option<AbortHandle>,
}

impl Pending {
    fn new(seq: u64) -> Self {
        Self { seq, abort: None }
    }

    fn matches(pending: &Option<Self>, seq: u64) -> bool {
        pending.as_ref().is_some_and(|p| p.seq == seq)
    }
}

struct PeerInfo {
    name: String,
    state: PeerState,
    owner: Option<String>,
    pid: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    proxy_pid: Option<u32>,
    cmdline: Option<String>,
    pending_owner: Option<Pending>,
    pending_pid: Option<Pending>,
    pending_identify: Option<Pending>,
    delete_timer: Option<Pending>,
    quit_subs: SlotList<QuitHandler>,
    state_subs: SlotList<StateHandler>,
    deferred: VecDeque<Message>,
    topic: Option<Topic>,
    nameowner_match: Option<OwnedMatchRule>,
}

impl PeerInfo {
    fn new(name: &str, topic: Option<Topic>, nameowner_match: Option<OwnedMatchRule>) -> Self {
        Self {
            name: name.to_string(),
            state: PeerState::Initial,
            owner: None,
            pid: None,
            uid: None,
            gid: None,
            proxy_pid: None,
            cmdline: None,
            pending_owner: None,
            pending_pid: None,
            pending_identify: None,
            delete_timer: None,
            quit_subs: SlotList::new(),
            state_subs: SlotList::new(),
            deferred: VecDeque::new(),
            topic,
            nameowner_match,
        }
    }

    fn is_private(&self) -> bool {
        self.name.starts_with(':')
    }

    fn identity_string(&self, privilege: Privilege) -> String {
        identity::IdentityLine {
            name: &self.name,
            owner: self.owner.as_deref(),
            pid: self.pid,
            uid: self.uid,
            gid: self.gid,
            privilege,
            cmdline: self.cmdline.as_deref(),
        }
        .to_string()
    }
}

/// Point-in-time view of a tracker, for debugging and tests.
#[derive(Clone, Debug)]
pub struct PeerSnapshot {
    pub state: PeerState,
    pub owner: Option<String>,
    pub pid: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub proxy_pid: Option<u32>,
    pub deferred: usize,
    pub pending_owner: Option<u64>,
    pub pending_pid: Option<u64>,
    pub pending_identify: Option<u64>,
    pub delete_timer: Option<u64>,
    pub quit_subscribers: usize,
    pub state_subscribers: usize,
}

enum Action {
    QueryOwner { name: String, seq: u64 },
    QueryPid { name: String, owner: String, seq: u64 },
    Identify { name: String, owner: String, seq: u64 },
    ArmDelete { name: String, seq: u64 },
    Abort(AbortHandle),
    Notify { name: String, state: PeerState },
    FireQuit { change: OwnerChange, handlers: Vec<QuitHandler> },
    Replay { msgs: Vec<Message> },
    Publish { topic: Topic, liveness: Liveness },
    InstallMatch(OwnedMatchRule),
    RemoveMatch(OwnedMatchRule),
}

enum QueryKind {
    Owner,
    Pid,
    Identify,
    Delete,
}

struct BusHooks {
    conn: Connection,
    dbus: DBusProxy<'static>,
    wakelocks: Arc<WakelockHub>,
}

/// The tracker registry: at most one `PeerInfo` per live bus name.
pub struct Peers {
    entries: Mutex<HashMap<String, PeerInfo>>,
    seq: AtomicU64,
    bus: OnceLock<BusHooks>,
    replay: OnceLock<mpsc::UnboundedSender<Message>>,
    grace: Duration,
    privileged: PrivilegedIds,
    proxy_binary: PathBuf,
}

impl Peers {
    pub fn new(privileged: PrivilegedIds, grace: Duration, proxy_binary: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            bus: OnceLock::new(),
            replay: OnceLock::new(),
            grace,
            privileged,
            proxy_binary,
        })
    }

    /// Hook up the live connection; trackers created before this never issue
    /// queries (their replies are injected by tests).
    pub fn attach_bus(
        &self,
        conn: Connection,
        dbus: DBusProxy<'static>,
        wakelocks: Arc<WakelockHub>,
    ) {
        if self
            .bus
            .set(BusHooks {
                conn,
                dbus,
                wakelocks,
            })
            .is_err()
        {
            warn!("peer registry already attached to a connection");
        }
    }

    /// Where deferred method calls are replayed once their sender is RUNNING.
    pub fn attach_replay(&self, tx: mpsc::UnboundedSender<Message>) {
        let _ = self.replay.set(tx);
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Ensure a tracker exists for `name`.
    pub fn track(self: &Arc<Self>, name: &str) {
        self.ensure(name, None);
    }

    /// Ensure a tracker exists and publishes liveness to `topic`.
    pub fn track_with_topic(self: &Arc<Self>, name: &str, topic: Topic) {
        self.ensure(name, Some(topic));
    }

    fn ensure(self: &Arc<Self>, name: &str, topic: Option<Topic>) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            if let Some(info) = entries.get_mut(name) {
                if info.topic.is_none() {
                    info.topic = topic;
                }
                return;
            }
            let rule = match nameowner_rule(name) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!("no owner tracking for {name}: {e}");
                    None
                }
            };
            if let Some(rule) = &rule {
                actions.push(Action::InstallMatch(rule.clone()));
            }
            let mut info = PeerInfo::new(name, topic, rule);
            debug!("tracking peer {name}");
            self.enter(&mut info, PeerState::QueryOwner, &mut actions);
            entries.insert(name.to_string(), info);
        }
        self.apply(actions);
    }

    pub fn is_tracked(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn snapshot(&self, name: &str) -> Option<PeerSnapshot> {
        let entries = self.entries.lock().unwrap();
        entries.get(name).map(|info| PeerSnapshot {
            state: info.state,
            owner: info.owner.clone(),
            pid: info.pid,
            uid: info.uid,
            gid: info.gid,
            proxy_pid: info.proxy_pid,
            deferred: info.deferred.len(),
            pending_owner: info.pending_owner.as_ref().map(|p| p.seq),
            pending_pid: info.pending_pid.as_ref().map(|p| p.seq),
            pending_identify: info.pending_identify.as_ref().map(|p| p.seq),
            delete_timer: info.delete_timer.as_ref().map(|p| p.seq),
            quit_subscribers: info.quit_subs.len(),
            state_subscribers: info.state_subs.len(),
        })
    }

    /// The canonical identity line for a tracked peer.
    pub fn identity_of(&self, name: &str) -> Option<String> {
        let pid = {
            let entries = self.entries.lock().unwrap();
            entries.get(name)?.pid
        };
        // Privilege reads /proc; classify outside the lock.
        let privilege = identity::classify(pid, &self.privileged);
        let entries = self.entries.lock().unwrap();
        entries.get(name).map(|info| info.identity_string(privilege))
    }

    /// Live privilege of the process behind `sender`.
    pub fn privilege_of(&self, sender: &str) -> Privilege {
        let pid = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(sender)
                .filter(|info| info.state == PeerState::Running)
                .and_then(|info| info.pid)
        };
        identity::classify(pid, &self.privileged)
    }

    /// Park a method call on its sender until the privilege decision is in.
    pub fn defer(&self, sender: &str, msg: Message) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(sender) {
            Some(info) => {
                debug!("deferring call from {sender} until identity is known");
                info.deferred.push_back(msg);
                true
            }
            None => false,
        }
    }

    /// Subscribe to the peer leaving the bus; fires at most once.
    pub fn subscribe_quit(self: &Arc<Self>, name: &str, handler: QuitHandler) -> u64 {
        self.ensure(name, None);
        let mut entries = self.entries.lock().unwrap();
        let info = entries.get_mut(name).expect("tracker just ensured");
        info.quit_subs.insert(handler)
    }

    pub fn unsubscribe_quit(&self, name: &str, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(name) {
            Some(info) => {
                let removed = info.quit_subs.remove(id).is_some();
                info.quit_subs.sweep();
                removed
            }
            None => false,
        }
    }

    /// Subscribe to every state transition. Duplicate handlers (same `Arc`)
    /// are not added twice; the existing id is returned. The current state is
    /// delivered via a deferred task so the subscriber never runs before the
    /// subscription call returns.
    pub fn subscribe_state(self: &Arc<Self>, name: &str, handler: StateHandler) -> u64 {
        self.ensure(name, None);
        let id = {
            let mut entries = self.entries.lock().unwrap();
            let info = entries.get_mut(name).expect("tracker just ensured");
            let existing = info
                .state_subs
                .iter()
                .find(|&(_, h)| Arc::ptr_eq(h, &handler))
                .map(|(id, _)| id);
            match existing {
                Some(id) => return id,
                None => info.state_subs.insert(handler),
            }
        };
        let this = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            this.notify_state_single(&name, id);
        });
        id
    }

    /// Nil the subscription in place; safe to call from the handler itself.
    pub fn unsubscribe_state(&self, name: &str, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(name) {
            Some(info) => info.state_subs.remove(id).is_some(),
            None => false,
        }
    }

    /// Feed a `NameOwnerChanged` observation for a tracked name.
    pub fn handle_owner_change(self: &Arc<Self>, change: &OwnerChange) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(info) = entries.get_mut(&change.name) else {
                return;
            };
            let new = change.new.as_deref().filter(|s| !s.is_empty());
            self.set_owner(info, new, &mut actions);
        }
        self.apply(actions);
    }

    fn set_owner(&self, info: &mut PeerInfo, new: Option<&str>, actions: &mut Vec<Action>) {
        if info.owner.as_deref() == new {
            return;
        }
        match new {
            None => self.enter(info, PeerState::Stopped, actions),
            Some(owner) => {
                // Observers must see the old owner drop before the new one
                // is resolved.
                if info.state == PeerState::Running {
                    self.enter(info, PeerState::Stopped, actions);
                }
                info.owner = Some(owner.to_string());
                self.enter(info, PeerState::QueryPid, actions);
            }
        }
    }

    /// Outcome of the `GetNameOwner` round trip.
    pub fn on_owner_reply(self: &Arc<Self>, name: &str, seq: u64, outcome: ReplyOutcome) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(info) = entries.get_mut(name) else {
                return;
            };
            if !Pending::matches(&info.pending_owner, seq) {
                debug!("discarding stale owner reply for {name}");
                return;
            }
            info.pending_owner = None;
            match outcome {
                ReplyOutcome::Reply { msg, .. } => match msg.body().deserialize::<String>() {
                    Ok(owner) if !owner.is_empty() => {
                        info.owner = Some(owner);
                        self.enter(info, PeerState::QueryPid, &mut actions);
                    }
                    _ => self.enter(info, PeerState::Stopped, &mut actions),
                },
                ReplyOutcome::Error {
                    name: error,
                    message,
                    ..
                } => {
                    if error == ERROR_NAME_HAS_NO_OWNER {
                        debug!("{name} has no owner");
                    } else {
                        warn!("owner query for {name} failed: {error}: {message}");
                    }
                    self.enter(info, PeerState::Stopped, &mut actions);
                }
                ReplyOutcome::Canceled => {}
            }
        }
        self.apply(actions);
    }

    /// Outcome of the `GetConnectionUnixProcessID` round trip.
    pub fn on_pid_reply(self: &Arc<Self>, name: &str, seq: u64, outcome: ReplyOutcome) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(info) = entries.get_mut(name) else {
                return;
            };
            if !Pending::matches(&info.pending_pid, seq) {
                debug!("discarding stale pid reply for {name}");
                return;
            }
            info.pending_pid = None;
            match outcome {
                ReplyOutcome::Reply { msg, .. } => match msg.body().deserialize::<u32>() {
                    Ok(pid) if identity::is_sandbox_proxy(pid, &self.proxy_binary) => {
                        debug!("{name} is fronted by a sandbox proxy (pid {pid})");
                        info.proxy_pid = Some(pid);
                        self.enter(info, PeerState::Identify, &mut actions);
                    }
                    Ok(pid) => {
                        finalize_identity(info, pid);
                        self.enter(info, PeerState::Running, &mut actions);
                    }
                    Err(e) => {
                        warn!("bad pid reply for {name}: {e}");
                        self.enter(info, PeerState::Stopped, &mut actions);
                    }
                },
                ReplyOutcome::Error {
                    name: error,
                    message,
                    ..
                } => {
                    warn!("pid query for {name} failed: {error}: {message}");
                    self.enter(info, PeerState::Stopped, &mut actions);
                }
                ReplyOutcome::Canceled => {}
            }
        }
        self.apply(actions);
    }

    /// Outcome of the sandbox `Identify()` round trip.
    pub fn on_identify_reply(self: &Arc<Self>, name: &str, seq: u64, outcome: ReplyOutcome) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(info) = entries.get_mut(name) else {
                return;
            };
            if !Pending::matches(&info.pending_identify, seq) {
                debug!("discarding stale identify reply for {name}");
                return;
            }
            info.pending_identify = None;
            let identified = match outcome {
                ReplyOutcome::Reply { msg, .. } => msg
                    .body()
                    .deserialize::<HashMap<String, OwnedValue>>()
                    .ok()
                    .and_then(|dict| dict_pid(&dict)),
                ReplyOutcome::Error {
                    name: error,
                    message,
                    ..
                } => {
                    debug!("identify at {name} failed: {error}: {message}");
                    None
                }
                ReplyOutcome::Canceled => return,
            };
            // The proxy pid is better than nothing.
            match identified.or(info.proxy_pid) {
                Some(pid) => {
                    finalize_identity(info, pid);
                    self.enter(info, PeerState::Running, &mut actions);
                }
                None => self.enter(info, PeerState::Stopped, &mut actions),
            }
        }
        self.apply(actions);
    }

    /// The grace window for a stopped private name ran out.
    fn on_delete_timer(self: &Arc<Self>, name: &str, seq: u64) {
        let mut actions = Vec::new();
        {
            let mut entries = self.entries.lock().unwrap();
            let Some(info) = entries.get(name) else {
                return;
            };
            if !Pending::matches(&info.delete_timer, seq) || info.state != PeerState::Stopped {
                debug!("delete timer for {name} no longer applies");
                return;
            }
            let info = entries.remove(name).expect("entry just looked up");
            debug!("dropping stopped private peer {name}");
            self.collect_teardown(info, &mut actions);
        }
        self.apply(actions);
    }

    /// Drop every tracker; used at shutdown.
    pub fn clear(self: &Arc<Self>) {
        let infos: Vec<PeerInfo> = {
            let mut entries = self.entries.lock().unwrap();
            entries.drain().map(|(_, info)| info).collect()
        };
        let mut actions = Vec::new();
        for info in infos {
            self.collect_teardown(info, &mut actions);
        }
        self.apply(actions);
    }

    fn collect_teardown(&self, mut info: PeerInfo, actions: &mut Vec<Action>) {
        for pending in [
            info.pending_owner.take(),
            info.pending_pid.take(),
            info.pending_identify.take(),
            info.delete_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            if let Some(handle) = pending.abort {
                actions.push(Action::Abort(handle));
            }
        }
        if let Some(rule) = info.nameowner_match.take() {
            actions.push(Action::RemoveMatch(rule));
        }
    }

    /// Transition `info` into `to`, collecting side effects.
    fn enter(&self, info: &mut PeerInfo, to: PeerState, actions: &mut Vec<Action>) {
        // Leaving a state cancels its outstanding work.
        match info.state {
            PeerState::QueryOwner => cancel(&mut info.pending_owner, actions),
            PeerState::QueryPid => cancel(&mut info.pending_pid, actions),
            PeerState::Identify => cancel(&mut info.pending_identify, actions),
            PeerState::Stopped => cancel(&mut info.delete_timer, actions),
            PeerState::Initial | PeerState::Running => {}
        }

        trace!("peer {}: {} -> {}", info.name, info.state, to);
        info.state = to;
        actions.push(Action::Notify {
            name: info.name.clone(),
            state: to,
        });

        match to {
            PeerState::Initial => {}
            PeerState::QueryOwner => {
                if info.is_private() {
                    // A unique name is its own owner.
                    info.owner = Some(info.name.clone());
                    self.enter(info, PeerState::QueryPid, actions);
                    return;
                }
                info.owner = None;
                let seq = self.next_seq();
                info.pending_owner = Some(Pending::new(seq));
                actions.push(Action::QueryOwner {
                    name: info.name.clone(),
                    seq,
                });
            }
            PeerState::QueryPid => {
                info.pid = None;
                info.uid = None;
                info.gid = None;
                info.proxy_pid = None;
                info.cmdline = None;
                let owner = info.owner.clone().unwrap_or_default();
                let seq = self.next_seq();
                info.pending_pid = Some(Pending::new(seq));
                actions.push(Action::QueryPid {
                    name: info.name.clone(),
                    owner,
                    seq,
                });
            }
            PeerState::Identify => {
                let owner = info.owner.clone().unwrap_or_default();
                let seq = self.next_seq();
                info.pending_identify = Some(Pending::new(seq));
                actions.push(Action::Identify {
                    name: info.name.clone(),
                    owner,
                    seq,
                });
            }
            PeerState::Running => {
                let privilege = identity::classify(info.pid, &self.privileged);
                info!("peer ready: {}", info.identity_string(privilege));
                if let Some(topic) = &info.topic {
                    actions.push(Action::Publish {
                        topic: topic.clone(),
                        liveness: Liveness::Running,
                    });
                }
                if !info.deferred.is_empty() {
                    actions.push(Action::Replay {
                        msgs: info.deferred.drain(..).collect(),
                    });
                }
            }
            PeerState::Stopped => {
                if let Some(topic) = &info.topic {
                    actions.push(Action::Publish {
                        topic: topic.clone(),
                        liveness: Liveness::Stopped,
                    });
                }
                if !info.deferred.is_empty() {
                    warn!(
                        "dropping {} deferred calls from {}",
                        info.deferred.len(),
                        info.name
                    );
                    info.deferred.clear();
                }
                let handlers = info.quit_subs.drain();
                if !handlers.is_empty() {
                    actions.push(Action::FireQuit {
                        change: OwnerChange {
                            name: info.name.clone(),
                            old: info.owner.clone(),
                            new: None,
                        },
                        handlers,
                    });
                }
                info.owner = None;
                if info.is_private() {
                    let seq = self.next_seq();
                    info.delete_timer = Some(Pending::new(seq));
                    actions.push(Action::ArmDelete {
                        name: info.name.clone(),
                        seq,
                    });
                }
            }
        }
    }

    /// Execute collected side effects. Never called with the entry lock held.
    fn apply(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::QueryOwner { name, seq } => self.spawn_owner_query(name, seq),
                Action::QueryPid { name, owner, seq } => self.spawn_pid_query(name, owner, seq),
                Action::Identify { name, owner, seq } => self.spawn_identify(name, owner, seq),
                Action::ArmDelete { name, seq } => self.spawn_delete_timer(name, seq),
                Action::Abort(handle) => handle.abort(),
                Action::Notify { name, state } => self.notify_state(&name, state),
                Action::FireQuit { change, handlers } => {
                    for handler in handlers {
                        handler(&change);
                    }
                }
                Action::Replay { msgs } => match self.replay.get() {
                    Some(tx) => {
                        for msg in msgs {
                            let _ = tx.send(msg);
                        }
                    }
                    None => warn!("no dispatcher, dropping replayed calls"),
                },
                Action::Publish { topic, liveness } => topic.publish(liveness),
                Action::InstallMatch(rule) => {
                    if let Some(bus) = self.bus.get() {
                        let dbus = bus.dbus.clone();
                        tokio::spawn(async move {
                            if let Err(e) = dbus.add_match_rule((*rule).clone()).await {
                                warn!("failed to install match rule {}: {}", *rule, e);
                            }
                        });
                    }
                }
                Action::RemoveMatch(rule) => {
                    if let Some(bus) = self.bus.get() {
                        if !bus.conn.is_closed() {
                            let dbus = bus.dbus.clone();
                            tokio::spawn(async move {
                                if let Err(e) = dbus.remove_match_rule((*rule).clone()).await {
                                    debug!("failed to remove match rule {}: {}", *rule, e);
                                }
                            });
                        }
                    }
                }
            }
        }
    }

    /// Invoke every state subscriber present at this instant, tolerating
    /// removal from within a callback.
    fn notify_state(self: &Arc<Self>, name: &str, state: PeerState) {
        let ids = {
            let entries = self.entries.lock().unwrap();
            match entries.get(name) {
                Some(info) => info.state_subs.ids(),
                None => return,
            }
        };
        for id in ids {
            let handler = {
                let entries = self.entries.lock().unwrap();
                entries
                    .get(name)
                    .and_then(|info| info.state_subs.get(id))
                    .cloned()
            };
            if let Some(handler) = handler {
                handler(name, state);
            }
        }
        let mut entries = self.entries.lock().unwrap();
        if let Some(info) = entries.get_mut(name) {
            info.state_subs.sweep();
        }
    }

    fn notify_state_single(self: &Arc<Self>, name: &str, id: u64) {
        let fetched = {
            let entries = self.entries.lock().unwrap();
            entries
                .get(name)
                .and_then(|info| info.state_subs.get(id).cloned().map(|h| (h, info.state)))
        };
        if let Some((handler, state)) = fetched {
            handler(name, state);
        }
    }

    fn spawn_owner_query(self: &Arc<Self>, name: String, seq: u64) {
        let Some(bus) = self.bus.get() else {
            return;
        };
        let conn = bus.conn.clone();
        let wakelocks = bus.wakelocks.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = send::call_with_reply(
                &conn,
                &wakelocks,
                Some(DBUS_NAME),
                DBUS_PATH,
                Some(DBUS_INTERFACE),
                "GetNameOwner",
                &(name.as_str(),),
                None,
            )
            .await;
            this.on_owner_reply(&name, seq, outcome);
        })
        .abort_handle();
        self.store_abort(QueryKind::Owner, seq, handle);
    }

    fn spawn_pid_query(self: &Arc<Self>, name: String, owner: String, seq: u64) {
        let Some(bus) = self.bus.get() else {
            return;
        };
        let conn = bus.conn.clone();
        let wakelocks = bus.wakelocks.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = send::call_with_reply(
                &conn,
                &wakelocks,
                Some(DBUS_NAME),
                DBUS_PATH,
                Some(DBUS_INTERFACE),
                "GetConnectionUnixProcessID",
                &(owner.as_str(),),
                None,
            )
            .await;
            this.on_pid_reply(&name, seq, outcome);
        })
        .abort_handle();
        self.store_abort(QueryKind::Pid, seq, handle);
    }

    fn spawn_identify(self: &Arc<Self>, name: String, owner: String, seq: u64) {
        let Some(bus) = self.bus.get() else {
            return;
        };
        let conn = bus.conn.clone();
        let wakelocks = bus.wakelocks.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = send::call_with_reply(
                &conn,
                &wakelocks,
                Some(owner.as_str()),
                "/",
                Some(IDENTIFY_INTERFACE),
                IDENTIFY_MEMBER,
                &(),
                None,
            )
            .await;
            this.on_identify_reply(&name, seq, outcome);
        })
        .abort_handle();
        self.store_abort(QueryKind::Identify, seq, handle);
    }

    fn spawn_delete_timer(self: &Arc<Self>, name: String, seq: u64) {
        let grace = self.grace;
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            this.on_delete_timer(&name, seq);
        })
        .abort_handle();
        self.store_abort(QueryKind::Delete, seq, handle);
    }

    /// Attach an abort handle to the pending record that spawned the task.
    /// The record may already be gone (canceled before the spawn landed); in
    /// that case the task is aborted right away.
    fn store_abort(&self, kind: QueryKind, seq: u64, handle: AbortHandle) {
        let mut entries = self.entries.lock().unwrap();
        for info in entries.values_mut() {
            let pending = match kind {
                QueryKind::Owner => &mut info.pending_owner,
                QueryKind::Pid => &mut info.pending_pid,
                QueryKind::Identify => &mut info.pending_identify,
                QueryKind::Delete => &mut info.delete_timer,
            };
            if let Some(p) = pending {
                if p.seq == seq {
                    p.abort = Some(handle);
                    return;
                }
            }
        }
        handle.abort();
    }
}

fn cancel(pending: &mut Option<Pending>, actions: &mut Vec<Action>) {
    if let Some(p) = pending.take() {
        if let Some(handle) = p.abort {
            actions.push(Action::Abort(handle));
        }
    }
}

fn finalize_identity(info: &mut PeerInfo, pid: u32) {
    info.pid = Some(pid);
    if let Some((uid, gid)) = identity::process_uid_gid(pid) {
        info.uid = Some(uid);
        info.gid = Some(gid);
    }
    info.cmdline = identity::process_cmdline(pid);
}

fn dict_pid(dict: &HashMap<String, OwnedValue>) -> Option<u32> {
    match dict.get("pid").map(|v| &**v) {
        Some(Variant::I32(pid)) if *pid > 0 => Some(*pid as u32),
        _ => None,
    }
}

fn nameowner_rule(name: &str) -> anyhow::Result<OwnedMatchRule> {
    Ok(MatchRule::builder()
        .msg_type(MessageType::Signal)
        .sender(DBUS_NAME)?
        .interface(DBUS_INTERFACE)?
        .member("NameOwnerChanged")?
        .arg(0, name)?
        .build()
        .to_owned()
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers() -> Arc<Peers> {
        // A proxy path nothing resolves to, so the Identify branch stays off.
        Peers::new(
            PrivilegedIds::default(),
            Duration::from_millis(40),
            PathBuf::from("/nonexistent/proxy"),
        )
    }

    fn owner_reply(owner: &str) -> ReplyOutcome {
        let msg = Message::method_call("/", "Reply")
            .unwrap()
            .build(&(owner,))
            .unwrap();
        ReplyOutcome::reply(msg)
    }

    fn pid_reply(pid: u32) -> ReplyOutcome {
        let msg = Message::method_call("/", "Reply")
            .unwrap()
            .build(&(pid,))
            .unwrap();
        ReplyOutcome::reply(msg)
    }

    fn identify_reply(pid: Option<i32>) -> ReplyOutcome {
        let mut dict: HashMap<String, Variant<'_>> = HashMap::new();
        if let Some(pid) = pid {
            dict.insert("pid".into(), Variant::from(pid));
        }
        dict.insert("sandboxed".into(), Variant::from(true));
        let msg = Message::method_call("/", "Reply")
            .unwrap()
            .build(&dict)
            .unwrap();
        ReplyOutcome::reply(msg)
    }

    #[tokio::test]
    async fn unique_name_skips_owner_query() {
        let peers = peers();
        peers.track(":1.5");
        let snap = peers.snapshot(":1.5").unwrap();
        assert_eq!(snap.state, PeerState::QueryPid);
        assert_eq!(snap.owner.as_deref(), Some(":1.5"));
        assert!(snap.pending_owner.is_none());
        assert!(snap.pending_pid.is_some());
    }

    #[tokio::test]
    async fn well_known_name_resolves_through_owner_and_pid() {
        let peers = peers();
        peers.track("org.ex.A");
        let snap = peers.snapshot("org.ex.A").unwrap();
        assert_eq!(snap.state, PeerState::QueryOwner);
        let seq = snap.pending_owner.unwrap();

        peers.on_owner_reply("org.ex.A", seq, owner_reply(":1.5"));
        let snap = peers.snapshot("org.ex.A").unwrap();
        assert_eq!(snap.state, PeerState::QueryPid);
        assert_eq!(snap.owner.as_deref(), Some(":1.5"));

        let seq = snap.pending_pid.unwrap();
        peers.on_pid_reply("org.ex.A", seq, pid_reply(std::process::id()));
        let snap = peers.snapshot("org.ex.A").unwrap();
        assert_eq!(snap.state, PeerState::Running);
        assert_eq!(snap.pid, Some(std::process::id()));
        assert!(snap.uid.is_some());
        assert!(snap.gid.is_some());
    }

    #[tokio::test]
    async fn empty_owner_means_stopped() {
        let peers = peers();
        peers.track("org.ex.A");
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply("org.ex.A", seq, owner_reply(""));
        assert_eq!(
            peers.snapshot("org.ex.A").unwrap().state,
            PeerState::Stopped
        );
    }

    #[tokio::test]
    async fn name_has_no_owner_means_stopped() {
        let peers = peers();
        peers.track("org.ex.A");
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply(
            "org.ex.A",
            seq,
            ReplyOutcome::error(ERROR_NAME_HAS_NO_OWNER, "nobody"),
        );
        assert_eq!(
            peers.snapshot("org.ex.A").unwrap().state,
            PeerState::Stopped
        );
    }

    #[tokio::test]
    async fn stale_replies_are_discarded() {
        let peers = peers();
        peers.track("org.ex.A");
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply("org.ex.A", seq + 1000, owner_reply(":1.5"));
        let snap = peers.snapshot("org.ex.A").unwrap();
        assert_eq!(snap.state, PeerState::QueryOwner);
        assert_eq!(snap.pending_owner, Some(seq));
    }

    fn drive_running(peers: &Arc<Peers>, name: &str, owner: &str) {
        peers.track(name);
        if let Some(seq) = peers.snapshot(name).unwrap().pending_owner {
            peers.on_owner_reply(name, seq, owner_reply(owner));
        }
        let seq = peers.snapshot(name).unwrap().pending_pid.unwrap();
        peers.on_pid_reply(name, seq, pid_reply(std::process::id()));
        assert_eq!(peers.snapshot(name).unwrap().state, PeerState::Running);
    }

    #[tokio::test]
    async fn owner_swap_passes_through_stopped() {
        let peers = peers();
        drive_running(&peers, "org.ex.A", ":1.5");

        let log: Arc<Mutex<Vec<PeerState>>> = Arc::new(Mutex::new(Vec::new()));
        let handler: StateHandler = {
            let log = log.clone();
            Arc::new(move |_, state| log.lock().unwrap().push(state))
        };
        peers.subscribe_state("org.ex.A", handler);
        tokio::task::yield_now().await;
        assert_eq!(&*log.lock().unwrap(), &[PeerState::Running]);

        let quit_count = Arc::new(AtomicU64::new(0));
        let quit: QuitHandler = {
            let quit_count = quit_count.clone();
            Arc::new(move |change| {
                assert!(change.new.is_none());
                assert_eq!(change.old.as_deref(), Some(":1.5"));
                quit_count.fetch_add(1, Ordering::SeqCst);
            })
        };
        peers.subscribe_quit("org.ex.A", quit);

        peers.handle_owner_change(&OwnerChange {
            name: "org.ex.A".into(),
            old: Some(":1.5".into()),
            new: Some(":1.9".into()),
        });
        {
            let log = log.lock().unwrap();
            assert_eq!(
                &log[1..],
                &[PeerState::Stopped, PeerState::QueryPid],
                "observers must see the drop"
            );
        }
        assert_eq!(quit_count.load(Ordering::SeqCst), 1);

        let seq = peers.snapshot("org.ex.A").unwrap().pending_pid.unwrap();
        peers.on_pid_reply("org.ex.A", seq, pid_reply(std::process::id()));
        assert_eq!(
            peers.snapshot("org.ex.A").unwrap().state,
            PeerState::Running
        );
        assert_eq!(log.lock().unwrap().last(), Some(&PeerState::Running));
        // The quit subscriber drained; a second stop must not re-fire it.
        peers.handle_owner_change(&OwnerChange {
            name: "org.ex.A".into(),
            old: Some(":1.9".into()),
            new: None,
        });
        assert_eq!(quit_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reannounced_owner_is_a_no_op() {
        let peers = peers();
        drive_running(&peers, "org.ex.A", ":1.5");
        peers.handle_owner_change(&OwnerChange {
            name: "org.ex.A".into(),
            old: Some(":1.5".into()),
            new: Some(":1.5".into()),
        });
        assert_eq!(
            peers.snapshot("org.ex.A").unwrap().state,
            PeerState::Running
        );
    }

    #[tokio::test]
    async fn deferred_calls_drop_on_stop_and_replay_on_running() {
        let peers = peers();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peers.attach_replay(tx);

        peers.track("org.ex.A");
        let msg = Message::method_call("/x", "M").unwrap().build(&()).unwrap();
        assert!(peers.defer("org.ex.A", msg.clone()));
        assert!(!peers.defer("org.ex.unknown", msg.clone()));
        assert_eq!(peers.snapshot("org.ex.A").unwrap().deferred, 1);

        // Identity resolves: the parked call replays in arrival order.
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply("org.ex.A", seq, owner_reply(":1.5"));
        let seq = peers.snapshot("org.ex.A").unwrap().pending_pid.unwrap();
        peers.on_pid_reply("org.ex.A", seq, pid_reply(std::process::id()));
        assert_eq!(peers.snapshot("org.ex.A").unwrap().deferred, 0);
        assert!(rx.try_recv().is_ok());

        // A parked call on a dying peer is dropped, not replayed.
        assert!(peers.defer("org.ex.A", msg));
        peers.handle_owner_change(&OwnerChange {
            name: "org.ex.A".into(),
            old: Some(":1.5".into()),
            new: None,
        });
        assert_eq!(peers.snapshot("org.ex.A").unwrap().deferred, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sandbox_proxy_triggers_identify_with_real_pid() {
        // Pretend our own binary is the proxy.
        let own_exe = identity::process_exe(std::process::id()).unwrap();
        let peers = Peers::new(
            PrivilegedIds::default(),
            Duration::from_millis(40),
            own_exe,
        );

        peers.track(":1.7");
        let seq = peers.snapshot(":1.7").unwrap().pending_pid.unwrap();
        peers.on_pid_reply(":1.7", seq, pid_reply(std::process::id()));
        let snap = peers.snapshot(":1.7").unwrap();
        assert_eq!(snap.state, PeerState::Identify);
        assert_eq!(snap.proxy_pid, Some(std::process::id()));

        // The dict names the real pid.
        let seq = snap.pending_identify.unwrap();
        peers.on_identify_reply(
            ":1.7",
            seq,
            identify_reply(Some(std::process::id() as i32)),
        );
        let snap = peers.snapshot(":1.7").unwrap();
        assert_eq!(snap.state, PeerState::Running);
        assert_eq!(snap.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn identify_without_pid_falls_back_to_proxy() {
        let own_exe = identity::process_exe(std::process::id()).unwrap();
        let peers = Peers::new(
            PrivilegedIds::default(),
            Duration::from_millis(40),
            own_exe,
        );

        peers.track(":1.7");
        let seq = peers.snapshot(":1.7").unwrap().pending_pid.unwrap();
        peers.on_pid_reply(":1.7", seq, pid_reply(std::process::id()));
        let seq = peers.snapshot(":1.7").unwrap().pending_identify.unwrap();
        peers.on_identify_reply(":1.7", seq, identify_reply(None));
        let snap = peers.snapshot(":1.7").unwrap();
        assert_eq!(snap.state, PeerState::Running);
        assert_eq!(snap.pid, Some(std::process::id()));

        // Same again, but the call errors out entirely.
        peers.handle_owner_change(&OwnerChange {
            name: ":1.7".into(),
            old: None,
            new: Some(":1.7".into()),
        });
        let seq = peers.snapshot(":1.7").unwrap().pending_pid.unwrap();
        peers.on_pid_reply(":1.7", seq, pid_reply(std::process::id()));
        let seq = peers.snapshot(":1.7").unwrap().pending_identify.unwrap();
        peers.on_identify_reply(
            ":1.7",
            seq,
            ReplyOutcome::error("org.freedesktop.DBus.Error.UnknownMethod", "no Identify"),
        );
        assert_eq!(peers.snapshot(":1.7").unwrap().state, PeerState::Running);
    }

    #[tokio::test]
    async fn stopped_private_name_is_garbage_collected() {
        let peers = peers();
        peers.track(":1.9");
        let seq = peers.snapshot(":1.9").unwrap().pending_pid.unwrap();
        peers.on_pid_reply(":1.9", seq, pid_reply(std::process::id()));

        peers.handle_owner_change(&OwnerChange {
            name: ":1.9".into(),
            old: Some(":1.9".into()),
            new: None,
        });
        let snap = peers.snapshot(":1.9").unwrap();
        assert_eq!(snap.state, PeerState::Stopped);
        assert!(snap.delete_timer.is_some());

        // A quit subscriber arriving after the stop never fires; it is
        // dropped with the tracker at the end of the grace window.
        let late = Arc::new(AtomicU64::new(0));
        let quit: QuitHandler = {
            let late = late.clone();
            Arc::new(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            })
        };
        peers.subscribe_quit(":1.9", quit);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(peers.snapshot(":1.9").is_none());
        assert_eq!(late.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resurrection_cancels_the_delete_timer() {
        let peers = peers();
        peers.track(":1.9");
        let seq = peers.snapshot(":1.9").unwrap().pending_pid.unwrap();
        peers.on_pid_reply(":1.9", seq, pid_reply(std::process::id()));
        peers.handle_owner_change(&OwnerChange {
            name: ":1.9".into(),
            old: Some(":1.9".into()),
            new: None,
        });
        peers.handle_owner_change(&OwnerChange {
            name: ":1.9".into(),
            old: None,
            new: Some(":1.9".into()),
        });
        let snap = peers.snapshot(":1.9").unwrap();
        assert_eq!(snap.state, PeerState::QueryPid);
        assert!(snap.delete_timer.is_none());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(peers.snapshot(":1.9").is_some());
    }

    #[tokio::test]
    async fn state_subscribers_may_remove_themselves() {
        let peers = peers();
        peers.track("org.ex.A");

        let hits = Arc::new(AtomicU64::new(0));
        let id_cell: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
        let handler: StateHandler = {
            let peers = peers.clone();
            let hits = hits.clone();
            let id_cell = id_cell.clone();
            Arc::new(move |name, _| {
                hits.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *id_cell.lock().unwrap() {
                    peers.unsubscribe_state(name, id);
                }
            })
        };
        let id = peers.subscribe_state("org.ex.A", handler.clone());
        *id_cell.lock().unwrap() = Some(id);
        // Re-adding the same handler is a no-op returning the same id.
        assert_eq!(peers.subscribe_state("org.ex.A", handler), id);

        tokio::task::yield_now().await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Removed itself; further transitions are not delivered.
        let seq = peers.snapshot("org.ex.A").unwrap().pending_owner.unwrap();
        peers.on_owner_reply("org.ex.A", seq, owner_reply(""));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(peers.snapshot("org.ex.A").unwrap().state_subscribers, 0);
    }

    #[tokio::test]
    async fn privilege_is_unknown_until_running() {
        let peers = peers();
        peers.track("org.ex.A");
        assert_eq!(peers.privilege_of("org.ex.A"), Privilege::Unknown);
        assert_eq!(peers.privilege_of("org.ex.unknown"), Privilege::Unknown);
    }

    #[tokio::test]
    async fn identity_line_is_published() {
        let peers = peers();
        drive_running(&peers, "org.ex.A", ":1.5");
        let line = peers.identity_of("org.ex.A").unwrap();
        assert!(line.starts_with("name=org.ex.A owner=:1.5 pid="), "{line}");
    }
}
