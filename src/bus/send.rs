//! Outbound sends, each pinned awake by a wakelock.
//!
//! A reply-expecting call holds a uniquely named wakelock from the moment it
//! is queued; the guard travels inside the [`ReplyOutcome`] so it is only
//! released once the consumer has finished processing the outcome. Sends
//! that expect nothing take a short timed lock spanning the queueing.

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::error;
use zbus::{
    message::{Flags, Message},
    names::BusName,
    zvariant::DynamicType,
    Connection,
};

use crate::{
    registry::Registry,
    wakelock::{self, WakelockHub},
};

/// Applied when the caller does not supply a deadline, so a hung peer can
/// never pin a wakelock forever.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
const ERROR_NO_REPLY: &str = "org.freedesktop.DBus.Error.NoReply";

/// Everything an outbound call can come back as.
pub enum ReplyOutcome {
    Reply {
        msg: Message,
        guard: Option<wakelock::Guard>,
    },
    Error {
        name: String,
        message: String,
        guard: Option<wakelock::Guard>,
    },
    Canceled,
}

impl ReplyOutcome {
    /// A bare successful outcome, for driving state machines in tests.
    pub fn reply(msg: Message) -> Self {
        Self::Reply { msg, guard: None }
    }

    /// A bare error outcome, for driving state machines in tests.
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            name: name.into(),
            message: message.into(),
            guard: None,
        }
    }
}

impl std::fmt::Debug for ReplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reply { .. } => f.write_str("Reply"),
            Self::Error { name, message, .. } => {
                write!(f, "Error({name}: {message})")
            }
            Self::Canceled => f.write_str("Canceled"),
        }
    }
}

/// Issue a method call and wait for its reply.
pub async fn call_with_reply<B>(
    conn: &Connection,
    wakelocks: &std::sync::Arc<WakelockHub>,
    destination: Option<&str>,
    path: &str,
    interface: Option<&str>,
    member: &str,
    body: &B,
    timeout: Option<Duration>,
) -> ReplyOutcome
where
    B: Serialize + DynamicType,
{
    let guard = wakelocks.acquire_unique(wakelock::CALL_LOCK_PREFIX);
    let call = conn.call_method(destination, path, interface, member, body);
    match tokio::time::timeout(timeout.unwrap_or(DEFAULT_CALL_TIMEOUT), call).await {
        Ok(Ok(msg)) => ReplyOutcome::Reply {
            msg,
            guard: Some(guard),
        },
        Ok(Err(zbus::Error::MethodError(name, text, _))) => ReplyOutcome::Error {
            name: name.to_string(),
            message: text.unwrap_or_default(),
            guard: Some(guard),
        },
        Ok(Err(e)) => ReplyOutcome::Error {
            name: ERROR_FAILED.to_string(),
            message: e.to_string(),
            guard: Some(guard),
        },
        Err(_) => ReplyOutcome::Error {
            name: ERROR_NO_REPLY.to_string(),
            message: format!("no reply to {member} from {}", destination.unwrap_or("-")),
            guard: Some(guard),
        },
    }
}

/// Queue a method call that expects no reply.
pub async fn call_no_reply<B>(
    conn: &Connection,
    wakelocks: &WakelockHub,
    destination: Option<&str>,
    path: &str,
    interface: Option<&str>,
    member: &str,
    body: &B,
) -> Result<()>
where
    B: Serialize + DynamicType,
{
    wakelocks.acquire_timed(wakelock::SEND_LOCK, wakelock::SEND_LOCK_TIMEOUT);
    let mut builder = Message::method_call(path, member)?;
    if let Some(destination) = destination {
        builder = builder.destination(destination)?;
    }
    if let Some(interface) = interface {
        builder = builder.interface(interface)?;
    }
    let msg = builder
        .with_flags(Flags::NoReplyExpected)?
        .build(body)?;
    conn.send(&msg).await?;
    Ok(())
}

/// Broadcast a signal.
///
/// Signals must be declared in the registry's outbound manifest; an
/// undeclared one is logged as a bug but still sent.
pub async fn emit_signal<B>(
    conn: &Connection,
    wakelocks: &WakelockHub,
    registry: &Registry,
    path: &str,
    interface: &str,
    member: &str,
    body: &B,
) -> Result<()>
where
    B: Serialize + DynamicType,
{
    if !registry.signal_listed(interface, member) {
        error!("signal {interface}.{member} is sent but not introspected");
    }
    wakelocks.acquire_timed(wakelock::SEND_LOCK, wakelock::SEND_LOCK_TIMEOUT);
    conn.emit_signal(None::<BusName<'_>>, path, interface, member, body)
        .await?;
    Ok(())
}
