//! Inbound message routing.
//!
//! One task owns the message stream; every inbound message is classified,
//! matched against the handler registry in registration order, gated on the
//! sender's privilege for protected methods, and either invoked, denied, or
//! parked on the sender's peer tracker for replay once its identity is
//! resolved. Each dispatch holds a wakelock so a racing suspend cannot stall
//! a half-processed message.

use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use zbus::{
    message::{Message, Type as MessageType},
    Connection, MessageStream,
};

use crate::{
    config::Store,
    match_spec::MatchSpec,
    peer::{Peers, Privilege},
    registry::{DispatchView, HandlerContext, HandlerFn, Registry},
    wakelock::{self, WakelockHub},
};

const ERROR_AUTH_FAILED: &str = "org.freedesktop.DBus.Error.AuthFailed";
const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";

pub struct Dispatcher {
    conn: Connection,
    registry: Arc<Registry>,
    peers: Arc<Peers>,
    wakelocks: Arc<WakelockHub>,
    config: Arc<dyn Store>,
    stream: MessageStream,
    replay_rx: mpsc::UnboundedReceiver<Message>,
}

impl Dispatcher {
    pub fn new(
        conn: Connection,
        registry: Arc<Registry>,
        peers: Arc<Peers>,
        wakelocks: Arc<WakelockHub>,
        config: Arc<dyn Store>,
        replay_rx: mpsc::UnboundedReceiver<Message>,
    ) -> Self {
        let stream = MessageStream::from(&conn);
        Self {
            conn,
            registry,
            peers,
            wakelocks,
            config,
            stream,
            replay_rx,
        }
    }

    /// Pump messages until the connection goes away. Replayed calls from the
    /// peer tracker share the loop; their provenance marks them as replays.
    pub async fn run(mut self) -> Result<()> {
        loop {
            tokio::select! {
                maybe = self.stream.next() => match maybe {
                    Some(Ok(msg)) => self.dispatch_one(&msg, false).await,
                    Some(Err(e)) => warn!("failed to read message: {e}"),
                    None => {
                        info!("message stream ended");
                        break;
                    }
                },
                Some(msg) = self.replay_rx.recv() => self.dispatch_one(&msg, true).await,
            }
        }
        Ok(())
    }

    /// Route one message through the registry.
    pub async fn dispatch_one(&self, msg: &Message, replay: bool) {
        let msg_type = msg.message_type();
        if !matches!(
            msg_type,
            MessageType::MethodCall | MessageType::Signal | MessageType::Error
        ) {
            return;
        }
        let _dispatch_lock = self.wakelocks.acquire(wakelock::DISPATCH_LOCK);

        let header = msg.header();
        let sender = header.sender().map(|s| s.as_str().to_string());
        let interface = header.interface().map(|i| i.as_str().to_string());
        let member = header.member().map(|m| m.as_str().to_string());
        let error_name = header.error_name().map(|e| e.as_str().to_string());
        drop(header);
        trace!(
            "dispatching {:?} from {} ({}.{})",
            msg_type,
            sender.as_deref().unwrap_or("-"),
            interface.as_deref().unwrap_or("-"),
            member.as_deref().unwrap_or("-"),
        );

        if let Some(sender) = &sender {
            self.peers.track(sender);
        }

        let mut method_handled = false;
        for id in self.registry.slot_ids() {
            // Entries unregistered mid-dispatch read back as gone.
            let Some(entry) = self.registry.dispatch_view(id) else {
                continue;
            };
            if entry.kind != msg_type {
                continue;
            }
            match entry.kind {
                MessageType::MethodCall => {
                    if !entry.interface.matches(interface.as_deref())
                        || !entry.member.matches(member.as_deref())
                        || !sender_ok(&entry.sender, sender.as_deref())
                    {
                        continue;
                    }
                    if entry.privileged {
                        match self.gate(msg, &sender, &member, replay).await {
                            Gate::Pass => {}
                            Gate::Consumed => {
                                method_handled = true;
                                break;
                            }
                        }
                    }
                    self.invoke(&entry, msg).await;
                    // Method dispatch is terminal.
                    method_handled = true;
                    break;
                }
                MessageType::Signal => {
                    // Callback-less entries only describe outbound signals.
                    if entry.handler.is_none() {
                        continue;
                    }
                    if !entry.interface.matches(interface.as_deref())
                        || !entry.member.matches(member.as_deref())
                        || !sender_ok(&entry.sender, sender.as_deref())
                        || !entry.extra.matches(msg)
                    {
                        continue;
                    }
                    // Signal dispatch is not terminal.
                    self.invoke(&entry, msg).await;
                }
                MessageType::Error => {
                    if !entry.member.matches(error_name.as_deref()) {
                        continue;
                    }
                    self.invoke(&entry, msg).await;
                }
                _ => {}
            }
        }

        if msg_type == MessageType::MethodCall && !method_handled {
            debug!(
                "no handler for {}.{}",
                interface.as_deref().unwrap_or("-"),
                member.as_deref().unwrap_or("-")
            );
            self.send_error(
                msg,
                ERROR_UNKNOWN_METHOD,
                format!("Unknown method {}", member.as_deref().unwrap_or("?")),
            )
            .await;
        }

        self.registry.sweep();
    }

    /// Decide a privileged method call. `Pass` means invoke now.
    async fn gate(
        &self,
        msg: &Message,
        sender: &Option<String>,
        member: &Option<String>,
        replay: bool,
    ) -> Gate {
        let privilege = match sender {
            Some(sender) => self.peers.privilege_of(sender),
            None => Privilege::Unknown,
        };
        match privilege {
            Privilege::Yes => Gate::Pass,
            Privilege::Unknown if !replay => {
                // Identity still resolving; park the call for replay.
                if let Some(sender) = sender {
                    if self.peers.defer(sender, msg.clone()) {
                        return Gate::Consumed;
                    }
                }
                self.deny(msg, member).await;
                Gate::Consumed
            }
            _ => {
                self.deny(msg, member).await;
                Gate::Consumed
            }
        }
    }

    async fn deny(&self, msg: &Message, member: &Option<String>) {
        let member = member.as_deref().unwrap_or("?");
        let header = msg.header();
        warn!(
            "rejecting privileged call of {} from {}",
            member,
            header.sender().map(|s| s.as_str()).unwrap_or("-")
        );
        drop(header);
        self.send_error(
            msg,
            ERROR_AUTH_FAILED,
            format!("Not authorized to call {member}"),
        )
        .await;
    }

    async fn invoke(&self, entry: &DispatchView, msg: &Message) {
        let Some(handler) = entry.handler.clone() else {
            return;
        };
        let ctx = self.context(msg);
        if let Err(e) = run_handler(handler, ctx).await {
            warn!("handler failed: {e:#}");
        }
    }

    fn context(&self, msg: &Message) -> HandlerContext {
        HandlerContext {
            conn: self.conn.clone(),
            msg: msg.clone(),
            registry: self.registry.clone(),
            peers: self.peers.clone(),
            wakelocks: self.wakelocks.clone(),
            config: self.config.clone(),
        }
    }

    async fn send_error(&self, msg: &Message, name: &str, text: String) {
        let header = msg.header();
        let reply = Message::error(&header, name).and_then(|builder| builder.build(&(text,)));
        match reply {
            Ok(reply) => {
                if let Err(e) = self.conn.send(&reply).await {
                    warn!("failed to send error reply: {e}");
                }
            }
            Err(e) => warn!("failed to build error reply: {e}"),
        }
    }
}

enum Gate {
    Pass,
    Consumed,
}

/// A handler-side sender filter is only enforced when one was given.
fn sender_ok(spec: &MatchSpec, sender: Option<&str>) -> bool {
    match spec {
        MatchSpec::Any => true,
        MatchSpec::Exact(_) => spec.matches(sender),
    }
}

async fn run_handler(handler: HandlerFn, ctx: HandlerContext) -> Result<()> {
    handler(ctx).await
}
