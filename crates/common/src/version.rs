use std::fmt;

/// Protocol version announced to the coordinator in the `enable` payload
///  and in the `User-Agent` of every outgoing request.
pub const PROTOCOL_VERSION: &str = "1.13.1";

/// Name reported as the agent half of the `User-Agent` header.
pub const AGENT_NAME: &str = "bmclapi-agent";

#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub build_profile: &'static str,
    pub build_timestamp: &'static str,
    pub rust_version: &'static str,
    pub version: &'static str,
    pub package_version: &'static str,
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({}, built {} with {})",
            AGENT_NAME, self.package_version, self.build_profile, self.build_timestamp, self.rust_version
        )
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo {
        build_profile: env!("BUILD_PROFILE"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        rust_version: env!("RUST_VERSION"),
        version: env!("REPO_VERSION"),
        package_version: env!("CARGO_PKG_VERSION"),
    }
}

/// `openbmclapi-cluster/<protocol> bmclapi-agent/<crate version>`
pub fn user_agent() -> String {
    format!(
        "openbmclapi-cluster/{} {}/{}",
        PROTOCOL_VERSION,
        AGENT_NAME,
        env!("CARGO_PKG_VERSION")
    )
}

/// Runtime tag carried in the `flavor` block of the enable payload.
pub fn runtime_flavor() -> String {
    format!("Rust/{}", env!("CARGO_PKG_VERSION"))
}
