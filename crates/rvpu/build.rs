use std::process::Command;

/// Run `program args` and keep the first line of stdout, if it succeeds.
fn first_line(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    text.lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
}

fn main() {
    for (key, var) in [("RVPU_BUILD_TARGET", "TARGET"), ("RVPU_BUILD_PROFILE", "PROFILE")] {
        if let Ok(value) = std::env::var(var) {
            println!("cargo:rustc-env={key}={value}");
        }
        println!("cargo:rerun-if-env-changed={var}");
    }

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    if let Some(version) = first_line(&rustc, &["--version"]) {
        println!("cargo:rustc-env=RVPU_RUSTC_VERSION={version}");
    }
    if let Some(hash) = first_line("git", &["rev-parse", "--short=12", "HEAD"]) {
        println!("cargo:rustc-env=RVPU_GIT_HASH={hash}");
    }
}
