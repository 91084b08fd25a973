use kiln_schema::Vcs;
use std::fmt;
use std::process::Command;

/// A missing prerequisite with actionable install instructions.
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

/// Check host tools needed to sync sources and import base images.
/// Returns a list of missing items. Empty list means all prerequisites are met.
pub fn check_prereqs(vcs: Vcs) -> Vec<MissingPrereq> {
    let mut missing = Vec::new();

    if !command_exists("rsync") {
        missing.push(MissingPrereq {
            name: "rsync",
            purpose: "mirroring the source tree into the content-sync container",
            install_hint:
                "zypper install rsync | apt install rsync | dnf install rsync | pacman -S rsync",
        });
    }

    match vcs {
        Vcs::Hg if !command_exists("hg") => missing.push(MissingPrereq {
            name: "hg",
            purpose: "enumerating version-controlled files",
            install_hint: "pip install mercurial | apt install mercurial | dnf install mercurial",
        }),
        Vcs::Git if !command_exists("git") => missing.push(MissingPrereq {
            name: "git",
            purpose: "enumerating version-controlled files",
            install_hint: "zypper install git | apt install git | dnf install git | pacman -S git",
        }),
        _ => {}
    }

    if !command_exists("xz") {
        missing.push(MissingPrereq {
            name: "xz",
            purpose: "decompressing .xz base images before import",
            install_hint:
                "zypper install xz | apt install xz-utils | dnf install xz | pacman -S xz",
        });
    }

    missing
}

/// Format a list of missing prerequisites into a user-friendly error message.
pub fn format_missing(missing: &[MissingPrereq]) -> String {
    use std::fmt::Write as _;
    let mut msg = String::from("missing prerequisites:\n");
    for m in missing {
        let _ = writeln!(msg, "{m}");
    }
    msg.push_str("\nkiln requires these tools to sync sources and import base images.");
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prereq_display() {
        let m = MissingPrereq {
            name: "rsync",
            purpose: "mirroring sources",
            install_hint: "apt install rsync",
        };
        let s = format!("{m}");
        assert!(s.contains("rsync"));
        assert!(s.contains("mirroring sources"));
        assert!(s.contains("apt install rsync"));
    }

    #[test]
    fn format_missing_produces_readable_output() {
        let items = vec![
            MissingPrereq {
                name: "rsync",
                purpose: "sync",
                install_hint: "apt install rsync",
            },
            MissingPrereq {
                name: "xz",
                purpose: "decompress",
                install_hint: "apt install xz-utils",
            },
        ];
        let output = format_missing(&items);
        assert!(output.contains("missing prerequisites:"));
        assert!(output.contains("rsync"));
        assert!(output.contains("xz"));
    }

    #[test]
    fn check_prereqs_names_are_known() {
        for m in check_prereqs(Vcs::Git) {
            assert!(["rsync", "git", "xz"].contains(&m.name));
        }
    }
}
