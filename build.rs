use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Git commit hash (8 chars) with optional "-dirty" suffix; "unknown"
    // outside a checkout or without git installed.
    let hash = Command::new("git")
        .args(["rev-parse", "--short=8", "HEAD"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_default();

    let dirty = Command::new("git")
        .args(["status", "--porcelain"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| !o.stdout.is_empty())
        .unwrap_or(false);

    let build_version = if hash.is_empty() {
        "unknown".to_string()
    } else if dirty {
        format!("{}-dirty", hash)
    } else {
        hash
    };

    println!("cargo:rustc-env=BUILD_VERSION={}", build_version);
}
