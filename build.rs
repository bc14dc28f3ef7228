// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

fn main() {
    println!("cargo::rerun-if-changed=.git/HEAD");
    println!("cargo::rerun-if-changed=.git/refs/tags");
    println!("cargo::rerun-if-env-changed=VISION_MONITOR_VERSION");

    // Packagers can pin the version string explicitly
    let version = if let Ok(v) = std::env::var("VISION_MONITOR_VERSION") {
        v
    } else {
        describe_version()
    };

    println!("cargo::rustc-env=GIT_VERSION={}", version);
}

fn describe_version() -> String {
    let pkg_version = std::env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "0.0.0".into());

    let Some(hash) = git(&["rev-parse", "--short", "HEAD"]) else {
        return pkg_version;
    };

    // "v0.2.0" at a tag, "v0.2.0-5-gabcdef1" after it
    match git(&["describe", "--tags", "--match", "v*"]) {
        Some(described) => {
            let described = described.strip_prefix('v').unwrap_or(&described);
            let parts: Vec<&str> = described.rsplitn(3, '-').collect();
            if parts.len() >= 3 {
                format!("{}-dev-{}", parts[2], hash)
            } else {
                format!("{}-{}", described, hash)
            }
        }
        None => format!("{}-{}", pkg_version, hash),
    }
}

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}
