// nftables table management by shelling out to `nft`

use crate::flow::{Direction, Protocol};
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeSet;
use std::io;
use std::process::Command;

const CHAIN_UPLOAD: &str = "output";
const CHAIN_DOWNLOAD: &str = "input";

/// Our private `inet` table with one filter chain per direction
pub struct NftTable {
    name: String,
}

impl NftTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    /// Check if nftables is available
    pub fn is_available() -> bool {
        Command::new("nft")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn exists(&self) -> bool {
        Command::new("nft")
            .args(["list", "table", "inet", self.name.as_str()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Create the table and both chains, replacing a leftover from an
    /// earlier run that was not shut down cleanly.
    pub fn create(&self) -> Result<()> {
        if self.exists() {
            log::warn!("Removing stale nftables table inet {}", self.name);
            self.destroy()?;
        }

        run_nft(&["add", "table", "inet", self.name.as_str()])
            .context("Failed to create nftables table")?;

        for (chain, hook) in [(CHAIN_UPLOAD, "output"), (CHAIN_DOWNLOAD, "input")] {
            run_nft(&[
                "add", "chain", "inet", self.name.as_str(), chain, "{", "type", "filter", "hook", hook,
                "priority", "0", ";", "}",
            ])
            .with_context(|| format!("Failed to create {} chain", chain))?;
        }

        log::info!("Initialized nftables table inet {}", self.name);
        Ok(())
    }

    pub fn destroy(&self) -> Result<()> {
        run_nft(&["delete", "table", "inet", self.name.as_str()])
            .context("Failed to delete nftables table")?;
        log::info!("Cleaned up nftables table inet {}", self.name);
        Ok(())
    }

    /// Send traffic of the cgroup at `cgroup_path` (relative to the cgroup v2
    /// root) to NFQUEUE `queue_num`. Returns the nft rule handle.
    pub fn add_queue_rule(
        &self,
        direction: Direction,
        cgroup_path: &str,
        queue_num: u16,
    ) -> Result<u64> {
        let rule = queue_rule(cgroup_path, queue_num);
        let queue = format!("queue num {}", queue_num);
        self.add_rule(direction, &rule, &["cgroupv2", queue.as_str()])
            .with_context(|| format!("Failed to add queue rule for {}", cgroup_path))
    }

    /// Send traffic of already-open sockets on the given local ports to
    /// NFQUEUE `queue_num`. Returns the nft rule handle.
    pub fn add_port_rule(
        &self,
        direction: Direction,
        protocol: Protocol,
        ports: &BTreeSet<u16>,
        queue_num: u16,
    ) -> Result<u64> {
        let rule = port_rule(direction, protocol, ports, queue_num);
        let field = format!("{} {}", protocol_name(protocol), port_field(direction));
        let queue = format!("queue num {}", queue_num);
        self.add_rule(direction, &rule, &[field.as_str(), queue.as_str()])
            .with_context(|| format!("Failed to add {} rule for queue {}", field, queue_num))
    }

    /// Add `rule` and return its handle. `needles` identify the rule in a
    /// chain listing when nft does not echo the handle.
    fn add_rule(&self, direction: Direction, rule: &str, needles: &[&str]) -> Result<u64> {
        let chain = chain_for(direction);
        let output = run_nft(&[
            "--echo",
            "--handle",
            "add",
            "rule",
            "inet",
            self.name.as_str(),
            chain,
            rule,
        ])?;

        if let Some(handle) = parse_rule_handle(&output) {
            return Ok(handle);
        }

        // Older nft builds ignore --echo; find the rule in the listing
        let listing = run_nft(&["--handle", "list", "chain", "inet", self.name.as_str(), chain])
            .context("Failed to list nftables rules")?;
        listing
            .lines()
            .filter(|line| needles.iter().all(|needle| line.contains(*needle)))
            .find_map(parse_rule_handle)
            .ok_or_else(|| anyhow!("Could not find handle of rule \"{}\"", rule))
    }

    pub fn delete_rule(&self, direction: Direction, handle: u64) -> Result<()> {
        let handle_str = handle.to_string();
        run_nft(&[
            "delete",
            "rule",
            "inet",
            self.name.as_str(),
            chain_for(direction),
            "handle",
            handle_str.as_str(),
        ])
        .with_context(|| format!("Failed to delete nftables rule handle {}", handle))?;
        Ok(())
    }
}

fn chain_for(direction: Direction) -> &'static str {
    match direction {
        Direction::Upload => CHAIN_UPLOAD,
        Direction::Download => CHAIN_DOWNLOAD,
    }
}

/// `bypass` lets packets through if the reader is gone, so a crashed
/// process never blackholes the throttled application.
fn queue_rule(cgroup_path: &str, queue_num: u16) -> String {
    let level = cgroup_path.split('/').filter(|s| !s.is_empty()).count();
    format!(
        "socket cgroupv2 level {} \"{}\" queue num {} bypass",
        level, cgroup_path, queue_num
    )
}

/// Match by local port: source port on the way out, destination port on
/// the way in.
fn port_rule(
    direction: Direction,
    protocol: Protocol,
    ports: &BTreeSet<u16>,
    queue_num: u16,
) -> String {
    let list: Vec<String> = ports.iter().map(u16::to_string).collect();
    format!(
        "{} {} {{ {} }} queue num {} bypass",
        protocol_name(protocol),
        port_field(direction),
        list.join(", "),
        queue_num
    )
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    }
}

fn port_field(direction: Direction) -> &'static str {
    match direction {
        Direction::Upload => "sport",
        Direction::Download => "dport",
    }
}

/// Extract N from a line ending in `# handle N`
fn parse_rule_handle(output: &str) -> Option<u64> {
    output
        .lines()
        .find_map(|line| line.split("# handle ").nth(1))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

fn run_nft(args: &[&str]) -> Result<String> {
    let output = Command::new("nft")
        .args(args)
        .output()
        .context("Failed to execute nft")?;

    if output.status.success() {
        return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("Operation not permitted") {
        return Err(anyhow::Error::new(io::Error::new(
            io::ErrorKind::PermissionDenied,
            stderr,
        )));
    }
    Err(anyhow!("nft {} failed: {}", args.join(" "), stderr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_rule_targets_pid_cgroup() {
        assert_eq!(
            queue_rule("procshaper/pid_1234", 7100),
            "socket cgroupv2 level 2 \"procshaper/pid_1234\" queue num 7100 bypass"
        );
    }

    #[test]
    fn test_parse_rule_handle_from_echo() {
        let echo = "add rule inet procshaper output socket cgroupv2 level 2 \"procshaper/pid_1\" queue num 7100 bypass # handle 17\n";
        assert_eq!(parse_rule_handle(echo), Some(17));
    }

    #[test]
    fn test_parse_rule_handle_missing() {
        assert_eq!(parse_rule_handle("table inet procshaper {\n}\n"), None);
        assert_eq!(parse_rule_handle("# handle abc"), None);
    }

    #[test]
    fn test_chain_per_direction() {
        assert_eq!(chain_for(Direction::Upload), "output");
        assert_eq!(chain_for(Direction::Download), "input");
    }

    #[test]
    fn test_port_rule_matches_local_side() {
        let ports = BTreeSet::from([443, 50000]);
        assert_eq!(
            port_rule(Direction::Upload, Protocol::Tcp, &ports, 7101),
            "tcp sport { 443, 50000 } queue num 7101 bypass"
        );
        assert_eq!(
            port_rule(Direction::Download, Protocol::Udp, &BTreeSet::from([5353]), 7102),
            "udp dport { 5353 } queue num 7102 bypass"
        );
    }
}
