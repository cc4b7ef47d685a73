//! Introspection XML for the daemon's fixed object tree.

use crate::service;

use super::Registry;

const DOCTYPE: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
"#;

/// Stanzas every object carries.
const STANDARD_INTERFACES: &str = r#"  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect">
      <arg name="xml_data" type="s" direction="out"/>
    </method>
  </interface>
  <interface name="org.freedesktop.DBus.Peer">
    <method name="Ping"/>
    <method name="GetMachineId">
      <arg name="machine_uuid" type="s" direction="out"/>
    </method>
  </interface>
"#;

struct Node {
    path: &'static str,
    children: &'static [&'static str],
    interface: Option<&'static str>,
}

/// The daemon's namespace tree. Leaves expose a registry-backed interface,
/// inner nodes just list their children.
const TREE: &[Node] = &[
    Node {
        path: "/",
        children: &["com"],
        interface: None,
    },
    Node {
        path: "/com",
        children: &["devmode"],
        interface: None,
    },
    Node {
        path: "/com/devmode",
        children: &["daemon"],
        interface: None,
    },
    Node {
        path: "/com/devmode/daemon",
        children: &["request", "signal"],
        interface: None,
    },
    Node {
        path: service::REQUEST_PATH,
        children: &[],
        interface: Some(service::REQUEST_INTERFACE),
    },
    Node {
        path: service::SIGNAL_PATH,
        children: &[],
        interface: Some(service::SIGNAL_INTERFACE),
    },
];

/// Introspection document for `path`, or `None` for a path outside the tree.
pub fn node_xml(registry: &Registry, path: &str) -> Option<String> {
    let node = TREE.iter().find(|node| node.path == path)?;

    let mut xml = String::with_capacity(1024);
    xml.push_str(DOCTYPE);
    xml.push_str(&format!("<node name=\"{}\">\n", node.path));
    xml.push_str(STANDARD_INTERFACES);

    if let Some(interface) = node.interface {
        xml.push_str(&format!("  <interface name=\"{interface}\">\n"));
        for (member, args) in registry.methods_for(interface) {
            push_member(&mut xml, "method", &member, args.as_deref());
        }
        for (member, args) in registry.signals_for(interface) {
            push_member(&mut xml, "signal", &member, args.as_deref());
        }
        xml.push_str("  </interface>\n");
    }

    for child in node.children {
        xml.push_str(&format!("  <node name=\"{child}\"/>\n"));
    }

    xml.push_str("</node>\n");
    Some(xml)
}

fn push_member(xml: &mut String, element: &str, member: &str, args: Option<&str>) {
    match args {
        Some(args) => {
            xml.push_str(&format!("    <{element} name=\"{member}\">\n"));
            for line in args.lines() {
                xml.push_str("      ");
                xml.push_str(line);
                xml.push('\n');
            }
            xml.push_str(&format!("    </{element}>\n"));
        }
        None => xml.push_str(&format!("    <{element} name=\"{member}\"/>\n")),
    }
}
