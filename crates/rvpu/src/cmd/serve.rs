use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rvpu_peer::{Channel, PeerError, RemoteListener};
use rvpu_session::{DispatchSummary, Dispatcher, EngineRegistry, HandleTable};
use serde::Serialize;

use crate::cmd::ServeArgs;
use crate::exit::{peer_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{now_unix_seconds, print_report, OutputFormat};

#[derive(Serialize)]
struct ChannelReport {
    channel: String,
    primitives: u64,
    dropped: u64,
    engine_errors: u64,
    tasks: u64,
    deinit: bool,
    timestamp: String,
}

/// How long an idle accept or receive blocks before the stop flag is
/// checked again.
const STOP_POLL: Duration = Duration::from_millis(200);

type Worker = JoinHandle<Option<ChannelReport>>;

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if let Some(parent) = args.endpoint.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|err| {
                crate::exit::io_error(&format!("failed creating {}", parent.display()), err)
            })?;
        }
    }

    let listener =
        RemoteListener::bind(&args.endpoint).map_err(|err| peer_error("bind failed", err))?;
    tracing::info!(endpoint = %listener.path().display(), "engine host listening");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let accepted = serve_loop(&listener, &running, args.count, format)?;
    tracing::info!(accepted, "engine host stopped");
    Ok(SUCCESS)
}

/// Accept and serve channels until `running` clears or `count` channels
/// were accepted, then wait for every worker. Returns the accepted count.
fn serve_loop(
    listener: &RemoteListener,
    running: &Arc<AtomicBool>,
    count: Option<usize>,
    format: OutputFormat,
) -> CliResult<usize> {
    let registry = Arc::new(EngineRegistry::with_passthrough());
    let table = Arc::new(HandleTable::new());
    let stop = Arc::new(AtomicBool::new(false));
    let mut workers: Vec<Worker> = Vec::new();
    let mut accepted = 0usize;

    while running.load(Ordering::SeqCst) {
        if count.is_some_and(|count| accepted >= count) {
            break;
        }
        reap_finished(&mut workers, format)?;

        let mut channel = match listener.accept_timeout(STOP_POLL) {
            Ok(Some(channel)) => channel,
            Ok(None) => continue,
            Err(err) if is_per_channel_error(&err) => {
                tracing::warn!(error = %err, "channel rejected");
                continue;
            }
            Err(err) => return Err(peer_error("accept failed", err)),
        };
        accepted = accepted.saturating_add(1);

        if let Err(err) = channel.set_recv_timeout(Some(STOP_POLL)) {
            tracing::warn!(channel = channel.id(), error = %err, "channel dropped");
            continue;
        }
        let dispatcher = Dispatcher::new(Arc::clone(&registry), table.clone());
        let stop = Arc::clone(&stop);
        workers.push(thread::spawn(move || serve_channel(dispatcher, channel, &stop)));
    }

    if !running.load(Ordering::SeqCst) {
        tracing::info!(workers = workers.len(), "stopping channel workers");
        stop.store(true, Ordering::SeqCst);
    }
    for worker in workers {
        report_worker(worker, format)?;
    }
    Ok(accepted)
}

/// Join and report the workers whose channel already closed.
fn reap_finished(workers: &mut Vec<Worker>, format: OutputFormat) -> CliResult<()> {
    let (done, live): (Vec<_>, Vec<_>) = workers.drain(..).partition(Worker::is_finished);
    *workers = live;
    for worker in done {
        report_worker(worker, format)?;
    }
    Ok(())
}

fn report_worker(worker: Worker, format: OutputFormat) -> CliResult<()> {
    match worker.join() {
        Ok(Some(report)) => {
            let rows = [
                ("channel", report.channel.clone()),
                ("primitives", report.primitives.to_string()),
                ("dropped", report.dropped.to_string()),
                ("engine errors", report.engine_errors.to_string()),
                ("tasks", report.tasks.to_string()),
                ("deinit", report.deinit.to_string()),
            ];
            print_report("Channel", &report, &rows, format);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(_) => Err(CliError::new(INTERNAL, "channel worker panicked")),
    }
}

fn serve_channel(mut dispatcher: Dispatcher, mut channel: Channel, stop: &AtomicBool) -> Option<ChannelReport> {
    let id = channel.id().to_string();
    let span = tracing::info_span!("channel", id = %id);
    let _entered = span.enter();
    match dispatcher.run_until(&mut channel, stop) {
        Ok(summary) => {
            tracing::info!(
                channel = %id,
                primitives = summary.primitives,
                tasks = summary.tasks,
                "channel closed"
            );
            Some(report(id, &summary))
        }
        Err(err) => {
            tracing::error!(channel = %id, error = %err, "channel failed");
            None
        }
    }
}

fn report(channel: String, summary: &DispatchSummary) -> ChannelReport {
    ChannelReport {
        channel,
        primitives: summary.primitives,
        dropped: summary.dropped,
        engine_errors: summary.engine_errors,
        tasks: summary.tasks,
        deinit: summary.deinit,
        timestamp: now_unix_seconds(),
    }
}

/// Failures that concern one client only; the listener keeps going.
fn is_per_channel_error(err: &PeerError) -> bool {
    matches!(
        err,
        PeerError::HandshakeMismatch { .. }
            | PeerError::UnsupportedTag(_)
            | PeerError::Timeout(_)
            | PeerError::Disconnected(_)
            | PeerError::Frame(_)
    )
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
