use rvpu_frame::{DEFAULT_TX_CAPACITY, MAX_CONTEXT_SIZE};
use rvpu_peer::CHANNEL_TAG_RVPU;
use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::{print_report, OutputFormat};

const UNKNOWN: &str = "unknown";

/// Build provenance plus the wire limits this binary speaks.
#[derive(Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    target: &'static str,
    profile: &'static str,
    rustc: &'static str,
    git_hash: &'static str,
    default_endpoint: String,
    channel_tag: u8,
    max_context_size: usize,
    tx_capacity: usize,
    async_codec: bool,
}

impl BuildInfo {
    fn current() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target: option_env!("RVPU_BUILD_TARGET").unwrap_or(UNKNOWN),
            profile: option_env!("RVPU_BUILD_PROFILE").unwrap_or(UNKNOWN),
            rustc: option_env!("RVPU_RUSTC_VERSION").unwrap_or(UNKNOWN),
            git_hash: option_env!("RVPU_GIT_HASH").unwrap_or(UNKNOWN),
            default_endpoint: rvpu_transport::default_endpoint().display().to_string(),
            channel_tag: CHANNEL_TAG_RVPU,
            max_context_size: MAX_CONTEXT_SIZE,
            tx_capacity: DEFAULT_TX_CAPACITY,
            async_codec: cfg!(feature = "async"),
        }
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("version", self.version.to_string()),
            ("target", self.target.to_string()),
            ("profile", self.profile.to_string()),
            ("rustc", self.rustc.to_string()),
            ("git hash", self.git_hash.to_string()),
            ("endpoint", self.default_endpoint.clone()),
            ("channel tag", format!("{:#04x}", self.channel_tag)),
            (
                "max context",
                format!("{} (tx {})", self.max_context_size, self.tx_capacity),
            ),
            ("async codec", self.async_codec.to_string()),
        ]
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    let info = BuildInfo::current();
    if args.extended {
        print_report("Build", &info, &info.rows(), format);
    } else {
        println!("{} {}", info.name, info.version);
    }
    Ok(SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_info_reports_wire_limits() {
        let info = BuildInfo::current();
        assert_eq!(info.name, "rvpu");
        assert_eq!(info.max_context_size, 512);
        assert_eq!(info.tx_capacity, 520);

        let rows = info.rows();
        let tag = rows.iter().find(|(field, _)| *field == "channel tag").unwrap();
        assert_eq!(tag.1, "0x02");
    }

    #[test]
    fn build_info_serializes_flat() {
        let json = serde_json::to_value(BuildInfo::current()).unwrap();
        assert_eq!(json["channel_tag"], 2);
        assert!(json["git_hash"].is_string());
    }
}
