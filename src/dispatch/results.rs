//! Parsing of the scanner's XML report into [`ScanResults`].
//!
//! Only the fields the coordinator stores are extracted; unknown elements
//! are ignored.

use std::path::Path;

use roxmltree::{Document, Node};

use crate::error::ScanError;
use crate::models::{HostResult, PortResult, ScanResults, ScanSummary};

/// Reads and parses an XML report file.
pub async fn load_results(path: &Path) -> Result<ScanResults, ScanError> {
    let xml = tokio::fs::read_to_string(path).await?;
    parse_results(&xml)
}

pub fn parse_results(xml: &str) -> Result<ScanResults, ScanError> {
    let doc = Document::parse(xml).map_err(|e| ScanError::Results(e.to_string()))?;
    let root = doc.root_element();
    if root.tag_name().name() != "nmaprun" {
        return Err(ScanError::Results(format!(
            "unexpected root element <{}>",
            root.tag_name().name()
        )));
    }

    let mut summary = ScanSummary {
        scanner: attr(root, "scanner"),
        args: attr(root, "args"),
        start: attr(root, "start"),
        startstr: attr(root, "startstr"),
        version: attr(root, "version"),
        xmloutputversion: attr(root, "xmloutputversion"),
        ..ScanSummary::default()
    };

    let hosts: Vec<HostResult> = children(root, "host").map(parse_host).collect();

    let counts = children(root, "runstats")
        .flat_map(|stats| children(stats, "hosts"))
        .next();
    match counts {
        Some(node) => {
            summary.hosts_up = number(node, "up");
            summary.hosts_down = number(node, "down");
            summary.hosts_total = number(node, "total");
        }
        None => {
            let up = hosts.iter().filter(|h| h.is_up()).count() as u32;
            summary.hosts_up = up;
            summary.hosts_total = hosts.len() as u32;
            summary.hosts_down = summary.hosts_total - up;
        }
    }

    Ok(ScanResults { summary, hosts })
}

fn parse_host(host: Node<'_, '_>) -> HostResult {
    let status = children(host, "status")
        .next()
        .and_then(|n| n.attribute("state"))
        .unwrap_or("unknown")
        .to_string();

    // Prefer the IP address over a MAC address.
    let addresses: Vec<Node<'_, '_>> = children(host, "address").collect();
    let address = addresses
        .iter()
        .find(|n| matches!(n.attribute("addrtype"), Some("ipv4") | Some("ipv6")))
        .or_else(|| addresses.first())
        .and_then(|n| n.attribute("addr"))
        .unwrap_or_default()
        .to_string();

    let hostname = children(host, "hostnames")
        .flat_map(|n| children(n, "hostname"))
        .find_map(|n| n.attribute("name"))
        .map(str::to_string);

    let os_guesses = children(host, "os")
        .flat_map(|n| children(n, "osmatch"))
        .filter_map(|n| n.attribute("name"))
        .map(str::to_string)
        .collect();

    let ports = children(host, "ports")
        .flat_map(|n| children(n, "port"))
        .filter_map(parse_port)
        .collect();

    HostResult {
        address,
        hostname,
        status,
        os_guesses,
        ports,
    }
}

fn parse_port(port: Node<'_, '_>) -> Option<PortResult> {
    let number = port.attribute("portid")?.parse().ok()?;
    let state = children(port, "state")
        .next()
        .and_then(|n| n.attribute("state"))
        .unwrap_or("unknown")
        .to_string();
    let service = children(port, "service").next();

    let version = service.and_then(|svc| {
        let parts: Vec<&str> = ["product", "version", "extrainfo"]
            .iter()
            .filter_map(|key| svc.attribute(*key))
            .filter(|v| !v.is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    });

    Some(PortResult {
        number,
        protocol: port.attribute("protocol").unwrap_or("tcp").to_string(),
        state,
        service: service
            .and_then(|svc| svc.attribute("name"))
            .unwrap_or("unknown")
            .to_string(),
        version,
    })
}

fn children<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    node.children()
        .filter(move |n| n.is_element() && n.tag_name().name() == name)
}

fn attr(node: Node<'_, '_>, name: &str) -> String {
    node.attribute(name).unwrap_or_default().to_string()
}

fn number(node: Node<'_, '_>, name: &str) -> u32 {
    node.attribute(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or_default()
}
