//! Storage and matching for inbound-message handlers.
//!
//! Every method call, signal, and error reply the daemon reacts to goes
//! through one entry here. Signal entries with a callback get their
//! synthesized match rule installed on the bus; callback-less signal entries
//! describe the signals *we* emit and exist for introspection only, making
//! the registry double as the outbound-signal manifest.

pub mod introspect;

use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{anyhow, bail, Result};
use futures_util::future::BoxFuture;
use tracing::{debug, error, warn};
use zbus::{
    fdo::DBusProxy,
    message::{Flags, Message, Type as MessageType},
    names::ErrorName,
    Connection, MatchRule, OwnedMatchRule,
};

use crate::{
    config::Store,
    match_spec::{Clause, ExtraRule, MatchSpec},
    peer::Peers,
    slots::SlotList,
    wakelock::WakelockHub,
};

/// What a handler gets to work with.
#[derive(Clone)]
pub struct HandlerContext {
    pub conn: Connection,
    pub msg: Message,
    pub registry: Arc<Registry>,
    pub peers: Arc<Peers>,
    pub wakelocks: Arc<WakelockHub>,
    pub config: Arc<dyn Store>,
}

impl HandlerContext {
    /// Send the declared reply, unless the caller asked for silence.
    pub async fn reply<B>(&self, body: &B) -> Result<()>
    where
        B: serde::Serialize + zbus::zvariant::DynamicType,
    {
        let header = self.msg.header();
        if header.primary().flags().contains(Flags::NoReplyExpected) {
            return Ok(());
        }
        let reply = Message::method_return(&header)?.build(body)?;
        self.conn.send(&reply).await?;
        Ok(())
    }

    /// Send an error reply. Errors go out even for no-reply-flagged calls;
    /// only success is elided.
    pub async fn reply_error(&self, name: &str, text: impl Into<String>) -> Result<()> {
        let header = self.msg.header();
        let name = ErrorName::try_from(name)?;
        let reply = Message::error(&header, name)?.build(&(text.into(),))?;
        self.conn.send(&reply).await?;
        Ok(())
    }
}

/// Boxed handler callback; the future is driven by the dispatcher.
pub type HandlerFn =
    Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap a plain async fn into a [`HandlerFn`].
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<'static, Result<()>> { Box::pin(f(ctx)) })
}

/// A registration request.
pub struct HandlerSpec {
    pub kind: MessageType,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub extra_rule: Option<String>,
    pub args_xml: Option<String>,
    pub privileged: bool,
    pub handler: Option<HandlerFn>,
    /// Cleared for signal entries whose bus-side delivery is managed
    /// elsewhere (e.g. per-peer `NameOwnerChanged` matches).
    pub install_match: bool,
}

impl HandlerSpec {
    pub fn method_call(interface: &str, member: &str, handler: HandlerFn) -> Self {
        Self {
            kind: MessageType::MethodCall,
            sender: None,
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            extra_rule: None,
            args_xml: None,
            privileged: false,
            handler: Some(handler),
            install_match: true,
        }
    }

    pub fn signal(interface: &str, member: &str, handler: HandlerFn) -> Self {
        Self {
            kind: MessageType::Signal,
            sender: None,
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            extra_rule: None,
            args_xml: None,
            privileged: false,
            handler: Some(handler),
            install_match: true,
        }
    }

    /// A signal the daemon emits; listed for introspection, never invoked.
    pub fn signal_manifest(interface: &str, member: &str) -> Self {
        Self {
            kind: MessageType::Signal,
            sender: None,
            interface: Some(interface.to_string()),
            member: Some(member.to_string()),
            extra_rule: None,
            args_xml: None,
            privileged: false,
            handler: None,
            install_match: true,
        }
    }

    pub fn error(member: &str, handler: HandlerFn) -> Self {
        Self {
            kind: MessageType::Error,
            sender: None,
            interface: None,
            member: Some(member.to_string()),
            extra_rule: None,
            args_xml: None,
            privileged: false,
            handler: Some(handler),
            install_match: true,
        }
    }

    pub fn with_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn with_extra_rule(mut self, rule: &str) -> Self {
        self.extra_rule = Some(rule.to_string());
        self
    }

    pub fn with_args(mut self, xml: &str) -> Self {
        self.args_xml = Some(xml.to_string());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Skip bus-side match installation; delivery is arranged elsewhere.
    pub fn without_match(mut self) -> Self {
        self.install_match = false;
        self
    }
}

struct HandlerEntry {
    kind: MessageType,
    sender: MatchSpec,
    interface: MatchSpec,
    member: MatchSpec,
    extra: ExtraRule,
    args_xml: Option<String>,
    privileged: bool,
    handler: Option<HandlerFn>,
    match_rule: Option<OwnedMatchRule>,
}

/// Opaque registration handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cookie(u64);

/// A per-entry view the dispatcher matches against.
pub(crate) struct DispatchView {
    pub kind: MessageType,
    pub sender: MatchSpec,
    pub interface: MatchSpec,
    pub member: MatchSpec,
    pub extra: ExtraRule,
    pub privileged: bool,
    pub handler: Option<HandlerFn>,
}

struct BusHooks {
    conn: Connection,
    dbus: DBusProxy<'static>,
}

#[derive(Default)]
pub struct Registry {
    entries: Mutex<SlotList<HandlerEntry>>,
    bus: OnceLock<BusHooks>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Hook the registry up to a live connection so signal match rules get
    /// installed and removed on the bus.
    pub fn attach(&self, conn: Connection, dbus: DBusProxy<'static>) {
        if self.bus.set(BusHooks { conn, dbus }).is_err() {
            warn!("registry already attached to a connection");
        }
    }

    /// Store a handler entry. Signal entries with a callback get their match
    /// rule synthesized and installed.
    pub fn register(&self, spec: HandlerSpec) -> Result<Cookie> {
        let extra = match &spec.extra_rule {
            Some(rule) => ExtraRule::parse(rule)?,
            None => ExtraRule::default(),
        };
        let match_rule = match spec.kind {
            MessageType::MethodCall => {
                if spec.member.is_none() {
                    bail!("method call entry without a member");
                }
                if spec.handler.is_none() {
                    bail!("method call entry without a handler");
                }
                None
            }
            MessageType::Signal => {
                let interface = spec
                    .interface
                    .as_deref()
                    .ok_or_else(|| anyhow!("signal entry without an interface"))?;
                if spec.handler.is_some() && spec.install_match {
                    Some(synthesize_rule(
                        spec.sender.as_deref(),
                        interface,
                        spec.member.as_deref(),
                        &extra,
                    )?)
                } else {
                    None
                }
            }
            MessageType::Error => None,
            other => bail!("unsupported handler entry type {other:?}"),
        };

        if let Some(rule) = &match_rule {
            self.install_match(rule.clone());
        }

        let entry = HandlerEntry {
            kind: spec.kind,
            sender: MatchSpec::from_option(spec.sender.as_deref()),
            interface: MatchSpec::from_option(spec.interface.as_deref()),
            member: MatchSpec::from_option(spec.member.as_deref()),
            extra,
            args_xml: spec.args_xml,
            privileged: spec.privileged,
            handler: spec.handler,
            match_rule,
        };
        let id = self.entries.lock().unwrap().insert(entry);
        debug!("registered handler {id}");
        Ok(Cookie(id))
    }

    /// Nil the entry in place; storage is reclaimed by the sweep after the
    /// current dispatch. Unknown cookies are a programming error but not a
    /// fatal one.
    pub fn unregister(&self, cookie: Cookie) {
        let removed = self.entries.lock().unwrap().remove(cookie.0);
        match removed {
            Some(entry) => {
                if let Some(rule) = entry.match_rule {
                    self.remove_match(rule);
                }
                debug!("unregistered handler {}", cookie.0);
            }
            None => error!("unregister of unknown handler cookie {}", cookie.0),
        }
    }

    /// Reclaim nilled slots; called by the dispatcher between messages.
    pub fn sweep(&self) {
        self.entries.lock().unwrap().sweep();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn slot_ids(&self) -> Vec<u64> {
        self.entries.lock().unwrap().ids()
    }

    /// Live view of one entry, or `None` when it was unregistered after the
    /// id snapshot was taken.
    pub(crate) fn dispatch_view(&self, id: u64) -> Option<DispatchView> {
        let entries = self.entries.lock().unwrap();
        entries.get(id).map(|entry| DispatchView {
            kind: entry.kind,
            sender: entry.sender.clone(),
            interface: entry.interface.clone(),
            member: entry.member.clone(),
            extra: entry.extra.clone(),
            privileged: entry.privileged,
            handler: entry.handler.clone(),
        })
    }

    /// Whether a callback-less signal entry lists this outbound signal.
    pub fn signal_listed(&self, interface: &str, member: &str) -> bool {
        let entries = self.entries.lock().unwrap();
        let found = entries.iter().any(|(_, entry)| {
            entry.kind == MessageType::Signal
                && entry.handler.is_none()
                && entry.interface.exact() == Some(interface)
                && entry.member.exact() == Some(member)
        });
        found
    }

    /// `(member, args_xml)` of all method entries on an interface, for
    /// introspection.
    pub fn methods_for(&self, interface: &str) -> Vec<(String, Option<String>)> {
        self.members_for(interface, MessageType::MethodCall)
    }

    /// `(member, args_xml)` of all manifest signal entries on an interface.
    pub fn signals_for(&self, interface: &str) -> Vec<(String, Option<String>)> {
        self.members_for(interface, MessageType::Signal)
    }

    fn members_for(&self, interface: &str, kind: MessageType) -> Vec<(String, Option<String>)> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, entry)| {
                entry.kind == kind && entry.interface.exact() == Some(interface)
            })
            .filter_map(|(_, entry)| {
                entry
                    .member
                    .exact()
                    .map(|m| (m.to_string(), entry.args_xml.clone()))
            })
            .collect()
    }

    fn install_match(&self, rule: OwnedMatchRule) {
        let Some(bus) = self.bus.get() else {
            debug!("not connected, skipping match install");
            return;
        };
        let dbus = bus.dbus.clone();
        tokio::spawn(async move {
            if let Err(e) = dbus.add_match_rule((*rule).clone()).await {
                warn!("failed to install match rule {}: {}", *rule, e);
            }
        });
    }

    fn remove_match(&self, rule: OwnedMatchRule) {
        let Some(bus) = self.bus.get() else {
            return;
        };
        // A torn-down connection cannot and need not clean up its matches.
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

fn synthesize_rule(
    sender: Option<&str>,
    interface: &str,
    member: Option<&str>,
    extra: &ExtraRule,
) -> Result<OwnedMatchRule> {
    let mut builder = MatchRule::builder().msg_type(MessageType::Signal);
    if let Some(sender) = sender {
        builder = builder.sender(sender)?;
    }
    builder = builder.interface(interface)?;
    if let Some(member) = member {
        builder = builder.member(member)?;
    }
    for clause in extra.clauses() {
        match clause {
            Clause::Arg { index, value } => {
                builder = builder.arg(*index, value.as_str())?;
            }
            Clause::Path(path) => {
                builder = builder.path(path.as_str())?;
            }
        }
    }
    Ok(builder.build().to_owned().into())
}
