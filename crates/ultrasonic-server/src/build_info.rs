pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn build_source() -> &'static str {
    option_env!("ULTRASONIC_BUILD_SOURCE").unwrap_or("unknown")
}

pub fn profile() -> &'static str {
    option_env!("ULTRASONIC_PROFILE").unwrap_or("release")
}

pub fn target() -> &'static str {
    option_env!("ULTRASONIC_TARGET").unwrap_or("")
}

pub fn git_commit() -> Option<&'static str> {
    option_env!("ULTRASONIC_GIT_COMMIT")
}

pub fn git_dirty() -> Option<bool> {
    option_env!("ULTRASONIC_GIT_DIRTY").and_then(|s| match s {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    })
}
