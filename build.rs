use std::process::Command;

fn main() {
    // Get git SHA, tolerating builds outside a checkout
    let git_hash = match Command::new("git").args(["rev-parse", "HEAD"]).output() {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => "unknown".to_string(),
    };

    // Set as environment variable for use in option_env!
    println!("cargo:rustc-env=GIT_COMMIT_HASH={}", git_hash);

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs/heads");
}
