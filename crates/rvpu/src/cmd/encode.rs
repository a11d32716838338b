use std::sync::Arc;
use std::thread;

use rvpu_peer::Channel;
use rvpu_session::{
    ConfigRequest, Dispatcher, EngineRegistry, HandleTable, PrepConfig, RemoteSession,
    SessionConfig, TaskOutput, TaskStatus,
};
use serde::Serialize;

use crate::cmd::EncodeArgs;
use crate::exit::{io_error, peer_error, session_error, CliError, CliResult, INTERNAL, SUCCESS, TIMEOUT};
use crate::output::{print_report, OutputFormat};

#[derive(Serialize)]
struct EncodeOutput {
    backend: String,
    completion: &'static str,
    input_size: usize,
    length: usize,
    status: &'static str,
    result_bits: u64,
    timed_out: bool,
    engine_tasks: u64,
    engine_errors: u64,
}

pub fn run(args: EncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let frame = std::fs::read(&args.file)
        .map_err(|err| io_error(&format!("failed reading {}", args.file.display()), err))?;

    let table = Arc::new(HandleTable::new());
    let (client, mut server) =
        Channel::pair().map_err(|err| peer_error("channel setup failed", err))?;

    let host_table = table.clone();
    let host = thread::spawn(move || {
        let mut dispatcher = Dispatcher::new(Arc::new(EngineRegistry::with_passthrough()), host_table);
        dispatcher.run(&mut server)
    });

    let capacity = frame.len().max(1);
    let input = table.allocate(capacity);
    let output = table.allocate(capacity);
    input
        .write(&frame)
        .map_err(|err| CliError::new(INTERNAL, format!("input staging failed: {err}")))?;

    let config = SessionConfig::new(args.backend, args.mode.mode());
    let completion = config.completion.name();
    let mut session = RemoteSession::new(config);
    session
        .attach(client)
        .map_err(|err| session_error("init failed", err))?;

    if args.backend.is_encoder() {
        session
            .control(ConfigRequest::Prep(PrepConfig::input(args.width, args.height)))
            .map_err(|err| session_error("input configuration rejected", err))?;
    }
    session
        .gen_regs()
        .map_err(|err| session_error("regs failed", err))?;
    session
        .start(&input.descriptor().with_size(frame.len() as u64))
        .map_err(|err| session_error("start failed", err))?;
    let result = session
        .wait(&output.descriptor(), Some(&*output))
        .map_err(|err| session_error("wait failed", err))?;
    session
        .deinit()
        .map_err(|err| session_error("deinit failed", err))?;

    let summary = match host.join() {
        Ok(Ok(summary)) => summary,
        Ok(Err(err)) => return Err(session_error("engine host failed", err)),
        Err(_) => return Err(CliError::new(INTERNAL, "engine host panicked")),
    };

    let out = EncodeOutput {
        backend: args.backend.to_string(),
        completion,
        input_size: frame.len(),
        length: result.length,
        status: status_name(&result),
        result_bits: result.feedback.result_detail,
        timed_out: result.timed_out,
        engine_tasks: summary.tasks,
        engine_errors: summary.engine_errors,
    };
    print_encode(&out, format);

    if result.timed_out {
        return Ok(TIMEOUT);
    }
    Ok(SUCCESS)
}

fn status_name(result: &TaskOutput) -> &'static str {
    match (result.timed_out, result.feedback.status) {
        (true, _) => "timeout",
        (false, TaskStatus::Done) => "done",
        (false, TaskStatus::Failed) => "failed",
    }
}

fn print_encode(out: &EncodeOutput, format: OutputFormat) {
    let rows = [
        ("backend", out.backend.clone()),
        ("completion", out.completion.to_string()),
        ("input size", out.input_size.to_string()),
        ("output length", out.length.to_string()),
        ("status", out.status.to_string()),
        ("result bits", out.result_bits.to_string()),
        ("engine tasks", out.engine_tasks.to_string()),
        ("engine errors", out.engine_errors.to_string()),
    ];
    print_report("Encode", out, &rows, format);
}

#[cfg(test)]
mod tests {
    use rvpu_session::Feedback;

    use super::*;

    #[test]
    fn timeout_wins_over_feedback_status() {
        let result = TaskOutput {
            length: 0,
            feedback: Feedback::done(0),
            timed_out: true,
        };
        assert_eq!(status_name(&result), "timeout");

        let result = TaskOutput {
            length: 12,
            feedback: Feedback::done(12),
            timed_out: false,
        };
        assert_eq!(status_name(&result), "done");
    }
}
