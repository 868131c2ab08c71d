// Domain XML (`virsh dumpxml`): network interfaces and virtio device detection.

use roxmltree::{Document, Node};

use crate::models::{DeviceConfig, InterfaceInfo, VirtioFlags};

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name(tag))
}

/// Elements named `tag` directly under any `<devices>` element.
fn devices<'a, 'input: 'a>(
    doc: &'a Document<'input>,
    tag: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    doc.descendants()
        .filter(|n| n.has_tag_name("devices"))
        .flat_map(move |d| d.children().filter(move |c| c.has_tag_name(tag)))
}

fn attr_is(node: Option<Node<'_, '_>>, name: &str, expected: &str) -> bool {
    node.and_then(|n| n.attribute(name)) == Some(expected)
}

fn interface_info(iface: Node<'_, '_>) -> InterfaceInfo {
    let attr = |tag: &str, name: &str| {
        child(iface, tag)
            .and_then(|n| n.attribute(name))
            .map(str::to_string)
    };
    let source = child(iface, "source").and_then(|s| {
        s.attribute("network")
            .or_else(|| s.attribute("bridge"))
            .or_else(|| s.attribute("dev"))
            .map(str::to_string)
    });
    InterfaceInfo {
        type_: iface.attribute("type").unwrap_or("unknown").to_string(),
        mac: attr("mac", "address"),
        source,
        model: attr("model", "type"),
        target: attr("target", "dev"),
        alias: attr("alias", "name"),
        link_state: match child(iface, "link") {
            Some(link) => link.attribute("state").unwrap_or("unknown").to_string(),
            None => "up".to_string(),
        },
    }
}

fn virtio_flags(doc: &Document<'_>) -> VirtioFlags {
    VirtioFlags {
        disk: devices(doc, "disk").any(|d| attr_is(child(d, "target"), "bus", "virtio")),
        network: devices(doc, "interface").any(|i| attr_is(child(i, "model"), "type", "virtio")),
        balloon: devices(doc, "memballoon")
            .next()
            .is_some_and(|b| b.attribute("model") == Some("virtio")),
        serial: devices(doc, "channel").any(|c| attr_is(child(c, "target"), "type", "virtio")),
        rng: devices(doc, "rng")
            .next()
            .is_some_and(|r| r.attribute("model") == Some("virtio")),
        scsi: devices(doc, "controller").any(|c| {
            c.attribute("type") == Some("scsi") && c.attribute("model") == Some("virtio-scsi")
        }),
    }
}

/// Parse `virsh dumpxml`. Malformed XML yields an empty config.
pub fn parse_device_config(xml: &str) -> DeviceConfig {
    let doc = match Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::warn!(error = %e, operation = "parse_device_config", "invalid domain XML");
            return DeviceConfig::default();
        }
    };
    DeviceConfig {
        interfaces: devices(&doc, "interface").map(interface_info).collect(),
        virtio: virtio_flags(&doc),
    }
}
