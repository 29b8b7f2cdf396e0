use std::env;
use std::process::Command;

fn main() {
    // Record the commit the binary was built from, so that a running node
    // can report it. Falls back to `GIT_HEAD` from the environment, eg. when
    // building from a source tarball.
    let head = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|hash| hash.trim().to_owned())
        .unwrap_or_else(|| env::var("GIT_HEAD").unwrap_or_else(|_| "unknown".into()));

    println!("cargo:rustc-env=GIT_HEAD={head}");
    println!("cargo:rerun-if-changed=../.git/HEAD");
}
