use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use rvpu_session::{BackendKind, CompletionMode};
use rvpu_transport::{DEFAULT_ENDPOINT, ENDPOINT_ENV};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod decode_frames;
pub mod encode;
pub mod probe;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host codec engines on a rendezvous endpoint.
    Serve(ServeArgs),
    /// Connect to an engine host, open and close one session.
    Probe(ProbeArgs),
    /// Run one frame through an in-process engine host.
    Encode(EncodeArgs),
    /// Decode a captured primitive byte stream.
    DecodeFrames(DecodeFramesArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Probe(args) => probe::run(args, format),
        Command::Encode(args) => encode::run(args, format),
        Command::DecodeFrames(args) => decode_frames::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

/// Completion mode selectable on the command line.
#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum CompletionArg {
    Polling,
    RoundTrip,
}

impl CompletionArg {
    pub fn mode(self) -> CompletionMode {
        match self {
            CompletionArg::Polling => CompletionMode::polling(),
            CompletionArg::RoundTrip => CompletionMode::round_trip(),
        }
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    #[arg(env = ENDPOINT_ENV, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: PathBuf,
    /// Exit after serving N channels.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Socket path to connect to.
    #[arg(env = ENDPOINT_ENV, default_value = DEFAULT_ENDPOINT)]
    pub endpoint: PathBuf,
    /// Backend requested in INIT.
    #[arg(long, default_value = "h264_encoder")]
    pub backend: BackendKind,
    /// Connection timeout (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct EncodeArgs {
    /// Input frame to submit.
    #[arg(long)]
    pub file: PathBuf,
    /// Backend engine to run.
    #[arg(long, default_value = "h264_encoder")]
    pub backend: BackendKind,
    /// How completion is reported.
    #[arg(long, value_enum, default_value = "polling")]
    pub mode: CompletionArg,
    /// Input frame width.
    #[arg(long, default_value = "1280")]
    pub width: u16,
    /// Input frame height.
    #[arg(long, default_value = "720")]
    pub height: u16,
}

#[derive(Args, Debug)]
pub struct DecodeFramesArgs {
    /// Captured byte stream.
    #[arg(long)]
    pub file: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    if millis {
        Ok(Duration::from_millis(value))
    } else {
        Ok(Duration::from_secs(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn completion_arg_maps_to_modes() {
        assert!(CompletionArg::Polling.mode().is_polling());
        assert!(!CompletionArg::RoundTrip.mode().is_polling());
    }
}
