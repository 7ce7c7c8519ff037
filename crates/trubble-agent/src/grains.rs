//! Host attribute (grain) collection

use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// System hostname, or "localhost" when it cannot be read
pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".into())
}

/// Collect the built-in grains for this host
pub fn collect() -> BTreeMap<String, Value> {
    let mut grains = BTreeMap::new();
    let fqdn = hostname();
    let host = fqdn.split('.').next().unwrap_or(&fqdn).to_string();

    grains.insert("fqdn".into(), json!(fqdn));
    grains.insert("host".into(), json!(host));
    grains.insert("nodename".into(), json!(host));
    grains.insert("kernel".into(), json!(kernel_name()));
    grains.insert("cpuarch".into(), json!(std::env::consts::ARCH));

    collect_platform(&mut grains);

    debug!(count = grains.len(), "Collected grains");
    grains
}

fn kernel_name() -> &'static str {
    match std::env::consts::OS {
        "linux" => "Linux",
        "windows" => "Windows",
        "macos" => "Darwin",
        "freebsd" => "FreeBSD",
        other => other,
    }
}

#[cfg(unix)]
fn collect_platform(grains: &mut BTreeMap<String, Value>) {
    if let Some(release) = command_output("uname", &["-r"]) {
        grains.insert("kernelrelease".into(), json!(release));
    }

    if let Ok(content) = std::fs::read_to_string("/etc/os-release") {
        let release = parse_os_release(&content);
        if let Some(name) = release.get("NAME") {
            grains.insert("os".into(), json!(name));
        }
        if let Some(version) = release.get("VERSION_ID") {
            grains.insert("osrelease".into(), json!(version));
        }
        if let Some(family) = os_family(&release) {
            grains.insert("os_family".into(), json!(family));
        }
    }

    let mut ipv4 = command_output("hostname", &["-I"])
        .map(|out| parse_ipv4(&out))
        .unwrap_or_default();
    if !ipv4.iter().any(|ip| ip.starts_with("127.")) {
        ipv4.push("127.0.0.1".into());
    }
    grains.insert("ipv4".into(), json!(ipv4));

    if let Ok(routes) = std::fs::read_to_string("/proc/net/route") {
        grains.insert("ip_gw".into(), json!(has_default_route(&routes)));
    }

    if let Ok(uuid) = std::fs::read_to_string("/sys/class/dmi/id/product_uuid") {
        let uuid = uuid.trim();
        if !uuid.is_empty() {
            grains.insert("system_uuid".into(), json!(uuid.to_lowercase()));
        }
    }
}

#[cfg(not(unix))]
fn collect_platform(grains: &mut BTreeMap<String, Value>) {
    grains.insert("os_family".into(), json!(kernel_name()));
    grains.insert("ipv4".into(), json!(["127.0.0.1"]));
}

#[cfg(unix)]
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = std::process::Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// `KEY=value` pairs from an os-release file, quotes stripped
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
        .collect()
}

fn os_family(release: &BTreeMap<String, String>) -> Option<&'static str> {
    let ids = release
        .get("ID_LIKE")
        .into_iter()
        .chain(release.get("ID"))
        .flat_map(|v| v.split_whitespace())
        .collect::<Vec<_>>();

    ids.iter().find_map(|id| match *id {
        "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "amzn" => Some("RedHat"),
        "debian" | "ubuntu" => Some("Debian"),
        "suse" | "opensuse" | "sles" => Some("Suse"),
        "arch" => Some("Arch"),
        "alpine" => Some("Alpine"),
        _ => None,
    })
}

/// IPv4 addresses from whitespace-separated output
pub fn parse_ipv4(output: &str) -> Vec<String> {
    output
        .split_whitespace()
        .filter(|addr| addr.parse::<std::net::Ipv4Addr>().is_ok())
        .map(String::from)
        .collect()
}

/// Whether a `/proc/net/route` table has a default (0.0.0.0) route
pub fn has_default_route(routes: &str) -> bool {
    routes
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|destination| destination == "00000000")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_os_release_parsing() {
        let content = "NAME=\"Rocky Linux\"\nVERSION_ID=\"9.3\"\nID=\"rocky\"\nID_LIKE=\"rhel centos fedora\"\n# comment\n";
        let release = parse_os_release(content);
        assert_eq!(release["NAME"], "Rocky Linux");
        assert_eq!(release["VERSION_ID"], "9.3");
        assert_eq!(os_family(&release), Some("RedHat"));

        let ubuntu = parse_os_release("ID=ubuntu\nID_LIKE=debian\n");
        assert_eq!(os_family(&ubuntu), Some("Debian"));
    }

    #[test]
    fn test_ipv4_parsing() {
        let ips = parse_ipv4("10.0.0.5 172.17.0.1 fe80::1 ");
        assert_eq!(ips, vec!["10.0.0.5", "172.17.0.1"]);
    }

    #[test]
    fn test_default_route_detection() {
        let with_gw = "Iface\tDestination\tGateway\tFlags\n\
                       eth0\t00000000\t0102A8C0\t0003\n\
                       eth0\t0002A8C0\t00000000\t0001\n";
        assert!(has_default_route(with_gw));

        let without = "Iface\tDestination\tGateway\tFlags\n\
                       eth0\t0002A8C0\t00000000\t0001\n";
        assert!(!has_default_route(without));
    }

    #[test]
    fn test_collect_basics() {
        let grains = collect();
        assert!(grains.contains_key("fqdn"));
        assert!(grains.contains_key("host"));
        assert!(grains["ipv4"].as_array().map_or(false, |ips| !ips.is_empty()));
    }
}
