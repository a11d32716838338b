mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "rvpu", version, about = "Remote VPU codec proxy CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Log every primitive sent and received at trace level.
    #[arg(long, global = true)]
    trace_wire: bool,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level, cli.trace_wire);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::CompletionArg;

    #[test]
    fn parses_encode_subcommand() {
        let cli = Cli::try_parse_from([
            "rvpu",
            "encode",
            "--file",
            "/tmp/frame.yuv",
            "--backend",
            "jpeg_encoder",
            "--mode",
            "round-trip",
        ])
        .expect("encode args should parse");

        let Command::Encode(args) = cli.command else {
            panic!("expected encode");
        };
        assert_eq!(args.backend, rvpu_session::BackendKind::JpegEncoder);
        assert!(matches!(args.mode, CompletionArg::RoundTrip));
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = Cli::try_parse_from([
            "rvpu",
            "probe",
            "/tmp/rvpu.sock",
            "--backend",
            "vp9_encoder",
        ])
        .expect_err("unknown backend should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_probe_subcommand() {
        let cli = Cli::try_parse_from(["rvpu", "probe", "/tmp/rvpu.sock", "--timeout", "3s"])
            .expect("probe args should parse");
        assert!(matches!(cli.command, Command::Probe(_)));
    }

    #[test]
    fn parses_global_format_after_subcommand() {
        let cli = Cli::try_parse_from(["rvpu", "decode-frames", "--file", "/tmp/cap.bin", "--format", "json"])
            .expect("decode-frames args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::DecodeFrames(_)));
    }

    #[test]
    fn trace_wire_is_global() {
        let cli = Cli::try_parse_from(["rvpu", "serve", "--trace-wire", "--log-level", "trace"])
            .expect("serve args should parse");
        assert!(cli.trace_wire);
        assert!(matches!(cli.log_level, LogLevel::Trace));
    }
}
