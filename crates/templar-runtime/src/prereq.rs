use std::fmt;
use std::process::Command;

/// A missing host tool with actionable install instructions.
#[derive(Debug)]
pub struct MissingPrereq {
    pub name: &'static str,
    pub purpose: &'static str,
    pub install_hint: &'static str,
}

impl fmt::Display for MissingPrereq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "  - {}: {} (install: {})",
            self.name, self.purpose, self.install_hint
        )
    }
}

fn command_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

const PROXMOX_TOOLS: &[MissingPrereq] = &[
    MissingPrereq {
        name: "virt-customize",
        purpose: "offline disk image customization",
        install_hint: "apt install libguestfs-tools",
    },
    MissingPrereq {
        name: "qm",
        purpose: "creating and converting VM templates",
        install_hint: "run on a Proxmox VE node (pve-manager)",
    },
    MissingPrereq {
        name: "pvesh",
        purpose: "querying cluster resources and storage",
        install_hint: "run on a Proxmox VE node (pve-manager)",
    },
    MissingPrereq {
        name: "xz",
        purpose: "decompressing .xz cloud images",
        install_hint: "apt install xz-utils",
    },
];

/// Check the host tools needed to build templates on a Proxmox VE node.
/// An empty list means every prerequisite is present.
pub fn check_proxmox_prereqs() -> Vec<&'static MissingPrereq> {
    PROXMOX_TOOLS
        .iter()
        .filter(|p| !command_exists(p.name))
        .collect()
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[&MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nSet TEMPLAR_SKIP_PREREQS=1 to bypass this check.");
    msg
}
