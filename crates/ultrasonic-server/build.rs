use std::process::Command;

fn main() {
    println!("cargo:rerun-if-env-changed=ULTRASONIC_BUILD_SOURCE");
    println!("cargo:rerun-if-env-changed=ULTRASONIC_BUILD");

    if let Ok(profile) = std::env::var("PROFILE") {
        println!("cargo:rustc-env=ULTRASONIC_PROFILE={profile}");
    }
    if let Ok(target) = std::env::var("TARGET") {
        println!("cargo:rustc-env=ULTRASONIC_TARGET={target}");
    }

    if let Ok(source) = std::env::var("ULTRASONIC_BUILD_SOURCE") {
        println!("cargo:rustc-env=ULTRASONIC_BUILD_SOURCE={source}");
    }

    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_commit = run_git(["rev-parse", "--short=12", "HEAD"]);
    if let Some(commit) = git_commit.as_deref() {
        println!("cargo:rustc-env=ULTRASONIC_GIT_COMMIT={commit}");
    }
    let git_dirty = run_git(["status", "--porcelain"]).is_some_and(|s| !s.trim().is_empty());
    println!("cargo:rustc-env=ULTRASONIC_GIT_DIRTY={git_dirty}");

    if std::env::var_os("ULTRASONIC_BUILD_SOURCE").is_none() {
        let inferred = if git_commit.is_some() { "git" } else { "unknown" };
        println!("cargo:rustc-env=ULTRASONIC_BUILD_SOURCE={inferred}");
    }
}

fn run_git<const N: usize>(args: [&str; N]) -> Option<String> {
    let out = Command::new("git").args(args).output().ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8(out.stdout).ok()?;
    Some(s.trim().to_string())
}
