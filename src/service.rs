//! The daemon's reserved bus surface.
//!
//! Everything the core itself answers on the bus lives here: version and
//! config queries, suspend statistics, runtime verbosity, introspection, the
//! standard Peer interface, and the `NameOwnerChanged` hook that drives the
//! peer trackers. All of it is registered through the handler registry like
//! any topic-specific handler would be.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, warn};
use zbus::zvariant::{OwnedValue, Structure, Value as Variant};

use crate::{
    bus::send,
    clock,
    config,
    peer::OwnerChange,
    registry::{handler, introspect, Cookie, HandlerContext, HandlerSpec, Registry},
    tracing_subscriber as log_control,
    wakelock::WakelockHub,
};

/// The well-known name this daemon owns.
pub const WELL_KNOWN_NAME: &str = "com.devmode.daemon";
pub const REQUEST_PATH: &str = "/com/devmode/daemon/request";
pub const REQUEST_INTERFACE: &str = "com.devmode.daemon.request";
pub const SIGNAL_PATH: &str = "/com/devmode/daemon/signal";
pub const SIGNAL_INTERFACE: &str = "com.devmode.daemon.signal";

/// Domain error for settings-store failures.
pub const GCONF_ERROR: &str = "com.devmode.daemon.GConf.Error";

const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";

const DBUS_NAME: &str = "org.freedesktop.DBus";

/// Register the built-in handler array.
pub fn register_builtin(registry: &Registry) -> Result<Vec<Cookie>> {
    let specs = vec![
        HandlerSpec::method_call(
            "org.freedesktop.DBus.Introspectable",
            "Introspect",
            handler(introspect_cb),
        )
        .with_args(r#"<arg name="xml_data" type="s" direction="out"/>"#),
        HandlerSpec::method_call("org.freedesktop.DBus.Peer", "Ping", handler(ping_cb)),
        HandlerSpec::method_call(
            "org.freedesktop.DBus.Peer",
            "GetMachineId",
            handler(machine_id_cb),
        )
        .with_args(r#"<arg name="machine_uuid" type="s" direction="out"/>"#),
        HandlerSpec::method_call(REQUEST_INTERFACE, "get_version", handler(get_version_cb))
            .with_args(r#"<arg name="version" type="s" direction="out"/>"#),
        HandlerSpec::method_call(REQUEST_INTERFACE, "get_config", handler(get_config_cb))
            .with_args(
                "<arg name=\"key\" type=\"s\" direction=\"in\"/>\n\
                 <arg name=\"value\" type=\"v\" direction=\"out\"/>",
            ),
        HandlerSpec::method_call(
            REQUEST_INTERFACE,
            "get_config_all",
            handler(get_config_all_cb),
        )
        .with_args(r#"<arg name="values" type="a{sv}" direction="out"/>"#),
        HandlerSpec::method_call(REQUEST_INTERFACE, "set_config", handler(set_config_cb))
            .privileged()
            .with_args(
                "<arg name=\"key\" type=\"s\" direction=\"in\"/>\n\
                 <arg name=\"value\" type=\"v\" direction=\"in\"/>\n\
                 <arg name=\"changed\" type=\"b\" direction=\"out\"/>",
            ),
        HandlerSpec::method_call(REQUEST_INTERFACE, "reset_config", handler(reset_config_cb))
            .privileged()
            .with_args(
                "<arg name=\"prefix\" type=\"s\" direction=\"in\"/>\n\
                 <arg name=\"count\" type=\"i\" direction=\"out\"/>",
            ),
        HandlerSpec::method_call(
            REQUEST_INTERFACE,
            "get_suspend_stats",
            handler(get_suspend_stats_cb),
        )
        .with_args(
            "<arg name=\"uptime_ms\" type=\"x\" direction=\"out\"/>\n\
             <arg name=\"suspend_ms\" type=\"x\" direction=\"out\"/>",
        ),
        HandlerSpec::method_call(REQUEST_INTERFACE, "verbosity_get", handler(verbosity_get_cb))
            .with_args(r#"<arg name="level" type="i" direction="out"/>"#),
        HandlerSpec::method_call(REQUEST_INTERFACE, "verbosity_set", handler(verbosity_set_cb))
            .with_args(
                "<arg name=\"level\" type=\"i\" direction=\"in\"/>\n\
                 <arg name=\"success\" type=\"b\" direction=\"out\"/>",
            ),
        // Drives the peer trackers; deliveries come from the per-name
        // matches the trackers install themselves.
        HandlerSpec::signal(DBUS_NAME, "NameOwnerChanged", handler(name_owner_changed_cb))
            .with_sender(DBUS_NAME)
            .without_match(),
        // Outbound manifest.
        HandlerSpec::signal_manifest(SIGNAL_INTERFACE, "config_change_ind").with_args(
            "<arg name=\"key\" type=\"s\"/>\n\
             <arg name=\"value\" type=\"v\"/>",
        ),
    ];

    let mut cookies = Vec::with_capacity(specs.len());
    for spec in specs {
        cookies.push(registry.register(spec)?);
    }
    Ok(cookies)
}

/// Broadcast a settings change to whoever listens.
pub async fn broadcast_config_change(
    conn: &zbus::Connection,
    wakelocks: &WakelockHub,
    registry: &Registry,
    key: &str,
    value: &config::Value,
) -> Result<()> {
    let variant = value.to_variant()?;
    send::emit_signal(
        conn,
        wakelocks,
        registry,
        SIGNAL_PATH,
        SIGNAL_INTERFACE,
        "config_change_ind",
        &(key, variant),
    )
    .await
}

async fn introspect_cb(ctx: HandlerContext) -> Result<()> {
    let path = ctx
        .msg
        .header()
        .path()
        .map(|p| p.as_str().to_string())
        .unwrap_or_default();
    match introspect::node_xml(&ctx.registry, &path) {
        Some(xml) => ctx.reply(&(xml,)).await,
        None => {
            error!("introspect request for unknown path {path}");
            ctx.reply_error(ERROR_UNKNOWN_OBJECT, format!("Unknown object {path}"))
                .await
        }
    }
}

async fn ping_cb(ctx: HandlerContext) -> Result<()> {
    ctx.reply(&()).await
}

async fn machine_id_cb(ctx: HandlerContext) -> Result<()> {
    match std::fs::read_to_string("/etc/machine-id") {
        Ok(id) => ctx.reply(&(id.trim(),)).await,
        Err(e) => {
            ctx.reply_error(ERROR_FAILED, format!("No machine id: {e}"))
                .await
        }
    }
}

async fn get_version_cb(ctx: HandlerContext) -> Result<()> {
    ctx.reply(&(env!("CARGO_PKG_VERSION"),)).await
}

/// The key argument is a string or, for store compatibility, an object path.
fn key_argument(fields: &[Variant<'_>]) -> Option<String> {
    match fields.first() {
        Some(Variant::Str(s)) => Some(s.to_string()),
        Some(Variant::ObjectPath(p)) => Some(p.as_str().to_string()),
        _ => None,
    }
}

async fn get_config_cb(ctx: HandlerContext) -> Result<()> {
    let body = ctx.msg.body();
    let key = body
        .deserialize::<Structure<'_>>()
        .ok()
        .and_then(|s| key_argument(s.fields()));
    let Some(key) = key else {
        return ctx
            .reply_error(ERROR_INVALID_ARGS, "Expected a setting key")
            .await;
    };
    match ctx.config.get(&key).and_then(|v| v.to_variant()) {
        Ok(variant) => ctx.reply(&(variant,)).await,
        Err(e) => ctx.reply_error(GCONF_ERROR, e.to_string()).await,
    }
}

async fn get_config_all_cb(ctx: HandlerContext) -> Result<()> {
    let mut values: std::collections::HashMap<String, OwnedValue> =
        std::collections::HashMap::new();
    for (key, value) in ctx.config.get_all() {
        match value.to_variant() {
            Ok(variant) => {
                values.insert(key, variant);
            }
            Err(e) => warn!("unencodable setting {key}: {e}"),
        }
    }
    ctx.reply(&(values,)).await
}

async fn set_config_cb(ctx: HandlerContext) -> Result<()> {
    let body = ctx.msg.body();
    let structure = match body.deserialize::<Structure<'_>>() {
        Ok(s) => s,
        Err(e) => {
            return ctx
                .reply_error(ERROR_INVALID_ARGS, format!("Bad arguments: {e}"))
                .await;
        }
    };
    let fields = structure.fields();
    let key = key_argument(fields);
    let value = fields.get(1).and_then(|v| config::Value::from_variant(v).ok());
    let (Some(key), Some(value)) = (key, value) else {
        return ctx
            .reply_error(ERROR_INVALID_ARGS, "Expected a key and a typed value")
            .await;
    };
    match ctx.config.set(&key, value) {
        Ok(changed) => ctx.reply(&(changed,)).await,
        Err(e) => ctx.reply_error(GCONF_ERROR, e.to_string()).await,
    }
}

async fn reset_config_cb(ctx: HandlerContext) -> Result<()> {
    let prefix = match ctx.msg.body().deserialize::<String>() {
        Ok(prefix) => prefix,
        Err(e) => {
            return ctx
                .reply_error(ERROR_INVALID_ARGS, format!("Bad arguments: {e}"))
                .await;
        }
    };
    match ctx.config.reset(&prefix) {
        Ok(count) => ctx.reply(&(count,)).await,
        Err(e) => ctx.reply_error(GCONF_ERROR, e.to_string()).await,
    }
}

async fn get_suspend_stats_cb(ctx: HandlerContext) -> Result<()> {
    let (uptime_ms, suspend_ms) = clock::suspend_stats();
    ctx.reply(&(uptime_ms, suspend_ms)).await
}

async fn verbosity_get_cb(ctx: HandlerContext) -> Result<()> {
    ctx.reply(&(log_control::verbosity(),)).await
}

async fn verbosity_set_cb(ctx: HandlerContext) -> Result<()> {
    let level = match ctx.msg.body().deserialize::<i32>() {
        Ok(level) => level,
        Err(e) => {
            return ctx
                .reply_error(ERROR_INVALID_ARGS, format!("Bad arguments: {e}"))
                .await;
        }
    };
    ctx.reply(&(log_control::set_verbosity(level),)).await
}

async fn name_owner_changed_cb(ctx: HandlerContext) -> Result<()> {
    let (name, old, new) = match ctx.msg.body().deserialize::<(String, String, String)>() {
        Ok(args) => args,
        Err(e) => {
            warn!("malformed NameOwnerChanged: {e}");
            return Ok(());
        }
    };
    let change = OwnerChange {
        name,
        old: Some(old).filter(|s| !s.is_empty()),
        new: Some(new).filter(|s| !s.is_empty()),
    };
    ctx.peers.handle_owner_change(&change);
    Ok(())
}

/// Wire a settings store to the change-indication signal.
pub fn forward_config_changes(
    conn: zbus::Connection,
    wakelocks: Arc<WakelockHub>,
    registry: Arc<Registry>,
    store: &dyn config::Store,
) -> u64 {
    store.subscribe(Arc::new(move |key, value| {
        let conn = conn.clone();
        let wakelocks = wakelocks.clone();
        let registry = registry.clone();
        let key = key.to_string();
        let value = value.clone();
        tokio::spawn(async move {
            if let Err(e) =
                broadcast_config_change(&conn, &wakelocks, &registry, &key, &value).await
            {
                warn!("failed to broadcast change of {key}: {e}");
            }
        });
    }))
}
