//! [`Link`] over NetworkManager's `nmcli` and `/sys/class/net`
//!
//! Join and teardown commands are spawned without waiting; their effect is
//! observed through the interface's `operstate`. Finished commands are reaped
//! on the next spawn and when the link is dropped.

use super::{Link, LinkState};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use tracing::{debug, warn};

/// Connection name nmcli gives the hotspot it creates
const HOTSPOT_CONNECTION: &str = "Hotspot";

#[derive(Debug)]
pub struct NmcliLink {
    interface: String,
    sysfs_root: PathBuf,
    program: PathBuf,
    /// Spawned commands not yet reaped
    children: Vec<Child>,
}

impl NmcliLink {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            sysfs_root: PathBuf::from("/sys/class/net"),
            program: PathBuf::from("nmcli"),
            children: Vec::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn sysfs_attribute(&self, name: &str) -> Option<String> {
        let path = self.sysfs_root.join(&self.interface).join(name);
        std::fs::read_to_string(path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Collect finished commands, returning how many are still running
    fn reap_children(&mut self) -> usize {
        self.children.retain_mut(|child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                if !status.success() {
                    debug!(%status, "nmcli command failed");
                }
                false
            }
            Err(e) => {
                warn!("Failed to reap nmcli command: {}", e);
                false
            }
        });
        self.children.len()
    }

    /// Start `nmcli` with `args` and return without waiting for it
    ///
    /// `input` is written to the command's stdin, keeping it out of the
    /// process list.
    fn spawn(&mut self, args: &[&str], input: Option<&str>) -> bool {
        self.reap_children();
        let stdin = if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        };
        let mut child = match Command::new(&self.program)
            .args(args)
            .stdin(stdin)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(interface = %self.interface, "Failed to run nmcli: {}", e);
                return false;
            }
        };
        if let (Some(input), Some(mut pipe)) = (input, child.stdin.take()) {
            if let Err(e) = writeln!(pipe, "{input}") {
                warn!(interface = %self.interface, "Failed to pass secret to nmcli: {}", e);
            }
        }
        self.children.push(child);
        true
    }
}

impl Drop for NmcliLink {
    fn drop(&mut self) {
        let running = self.reap_children();
        if running > 0 {
            debug!(running, "nmcli commands still running at shutdown");
        }
    }
}

/// Arguments for joining `network_name`; the secret goes to stdin
fn join_args<'a>(interface: &'a str, network_name: &'a str) -> [&'a str; 7] {
    [
        "--ask",
        "device",
        "wifi",
        "connect",
        network_name,
        "ifname",
        interface,
    ]
}

/// Map a `/sys/class/net/<iface>/operstate` value to a [`LinkState`]
pub fn parse_operstate(raw: &str) -> LinkState {
    match raw.trim() {
        "up" => LinkState::Connected,
        "dormant" => LinkState::Connecting,
        _ => LinkState::Disconnected,
    }
}

/// Parse a MAC address in `aa:bb:cc:dd:ee:ff` form
pub fn parse_hardware_address(raw: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = raw.trim().split(':');
    for byte in &mut mac {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

/// Network names from `nmcli -t -f SSID device wifi list`, hidden networks dropped
pub fn parse_scan_output(output: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !names.iter().any(|n| n == line) {
            names.push(line.to_string());
        }
    }
    names
}

impl Link for NmcliLink {
    fn connect(&mut self, network_name: &str, secret: Option<&str>) -> bool {
        debug!(interface = %self.interface, network = network_name, "nmcli join");
        let interface = self.interface.clone();
        self.spawn(&join_args(&interface, network_name), secret)
    }

    fn disconnect(&mut self) {
        let interface = self.interface.clone();
        self.spawn(&["device", "disconnect", &interface], None);
    }

    fn status(&self) -> LinkState {
        self.sysfs_attribute("operstate")
            .map(|s| parse_operstate(&s))
            .unwrap_or(LinkState::Disconnected)
    }

    fn start_access_point(&mut self, ssid: &str, password: &str, address: Ipv4Addr) -> bool {
        // nmcli picks the hotspot subnet itself; the address is only reported
        debug!(interface = %self.interface, ssid, %address, "nmcli hotspot");
        let interface = self.interface.clone();
        self.spawn(
            &[
                "device", "wifi", "hotspot", "ifname", &interface, "ssid", ssid, "password",
                password,
            ],
            None,
        )
    }

    fn stop_access_point(&mut self) {
        self.spawn(&["connection", "down", HOTSPOT_CONNECTION], None);
    }

    fn scan(&mut self) -> Vec<String> {
        match Command::new("nmcli")
            .args(["-t", "-f", "SSID", "device", "wifi", "list"])
            .output()
        {
            Ok(output) if output.status.success() => {
                parse_scan_output(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(status = %output.status, "nmcli scan failed");
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to run nmcli scan: {}", e);
                Vec::new()
            }
        }
    }

    fn hardware_address(&self) -> [u8; 6] {
        self.sysfs_attribute("address")
            .and_then(|s| parse_hardware_address(&s))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn link_with_sysfs(operstate: &str, address: &str) -> (TempDir, NmcliLink) {
        let dir = TempDir::new().unwrap();
        let iface = dir.path().join("wlan0");
        std::fs::create_dir_all(&iface).unwrap();
        std::fs::write(iface.join("operstate"), operstate).unwrap();
        std::fs::write(iface.join("address"), address).unwrap();

        let mut link = NmcliLink::new("wlan0");
        link.sysfs_root = dir.path().to_path_buf();
        (dir, link)
    }

    #[test]
    fn test_status_from_operstate() {
        let (_dir, link) = link_with_sysfs("up\n", "00:00:00:00:00:00\n");
        assert_eq!(link.status(), LinkState::Connected);

        assert_eq!(parse_operstate("dormant"), LinkState::Connecting);
        assert_eq!(parse_operstate("down"), LinkState::Disconnected);
        assert_eq!(parse_operstate("unknown"), LinkState::Disconnected);
    }

    #[test]
    fn test_missing_interface_is_disconnected() {
        let mut link = NmcliLink::new("does-not-exist0");
        link.sysfs_root = PathBuf::from("/nonexistent/sys/class/net");
        assert_eq!(link.status(), LinkState::Disconnected);
        assert_eq!(link.hardware_address(), [0u8; 6]);
    }

    #[test]
    fn test_hardware_address_from_sysfs() {
        let (_dir, link) = link_with_sysfs("down\n", "5c:cf:7f:0a:00:ff\n");
        assert_eq!(link.hardware_address(), [0x5c, 0xcf, 0x7f, 0x0a, 0x00, 0xff]);
    }

    #[test]
    fn test_parse_hardware_address_rejects_malformed() {
        assert_eq!(parse_hardware_address("5c:cf:7f"), None);
        assert_eq!(parse_hardware_address("5c:cf:7f:0a:00:ff:11"), None);
        assert_eq!(parse_hardware_address("zz:cf:7f:0a:00:ff"), None);
    }

    #[test]
    fn test_join_keeps_secret_out_of_arguments() {
        assert_eq!(
            join_args("wlan0", "home"),
            ["--ask", "device", "wifi", "connect", "home", "ifname", "wlan0"]
        );
    }

    #[test]
    fn test_finished_commands_are_reaped() {
        // Arrange: a stand-in command that exits immediately
        let mut link = NmcliLink::new("wlan0");
        link.program = PathBuf::from("true");

        // Act
        assert!(link.connect("home", Some("hunter22")));
        link.disconnect();
        link.stop_access_point();

        // Assert
        let mut running = link.children.len();
        for _ in 0..200 {
            running = link.reap_children();
            if running == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(running, 0);
    }

    #[test]
    fn test_missing_program_reports_failure() {
        let mut link = NmcliLink::new("wlan0");
        link.program = PathBuf::from("/nonexistent/nmcli");

        assert!(!link.connect("home", None));
        assert!(link.children.is_empty());
    }

    #[test]
    fn test_parse_scan_output_dedups_and_skips_hidden() {
        let output = "home\n\nbackup\nhome\n";
        assert_eq!(parse_scan_output(output), vec!["home", "backup"]);
    }
}
