use std::io::{ErrorKind, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use scopelink_frame::codes::{STAGE_POSITION_GET, SYSTEM_STATE_CHANGED, SYSTEM_STATE_GET};
use scopelink_frame::{FrameError, FrameReader, FrameWriter, Message, ReadEvent};
use scopelink_transport::live_port_for;
use tracing::{debug, info, warn};

use crate::cmd::{install_ctrlc_handler, parse_duration, SimulateArgs};
use crate::exit::{io_error, transport_error, CliResult, SUCCESS};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_POLL: Duration = Duration::from_millis(200);
const LIVE_ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
const STATES: [&str; 3] = ["Idle", "Busy", "Acquiring"];

type SharedWriter = Arc<Mutex<FrameWriter<TcpStream>>>;

pub fn run(args: SimulateArgs) -> CliResult<i32> {
    let interval = parse_duration(&args.notify_interval)?;
    let live_port = live_port_for(args.port).map_err(|err| transport_error("invalid port", err))?;
    let command_listener = bind(args.port)?;
    let live_listener = bind(live_port)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    info!(command_port = args.port, live_port, "simulator listening");

    let mut sessions = 0u64;
    while running.load(Ordering::SeqCst) {
        let Some(command) = accept(&command_listener, &running, None)? else {
            break;
        };
        let Some(live) = accept(&live_listener, &running, Some(LIVE_ACCEPT_TIMEOUT))? else {
            warn!("client did not open the live channel");
            continue;
        };

        sessions += 1;
        info!(session = sessions, "client connected");
        if let Err(err) = serve(command, live, interval, &running) {
            warn!(session = sessions, error = %err, "session ended with error");
        }
        info!(session = sessions, "client disconnected");
    }

    Ok(SUCCESS)
}

fn bind(port: u16) -> CliResult<TcpListener> {
    let context = format!("bind 127.0.0.1:{port} failed");
    let listener = TcpListener::bind(("127.0.0.1", port)).map_err(|err| io_error(&context, err))?;
    listener
        .set_nonblocking(true)
        .map_err(|err| io_error(&context, err))?;
    Ok(listener)
}

fn accept(listener: &TcpListener, running: &AtomicBool, timeout: Option<Duration>) -> CliResult<Option<TcpStream>> {
    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(false)
                    .and_then(|()| stream.set_nodelay(true))
                    .map_err(|err| io_error("configure accepted stream", err))?;
                debug!(%peer, "accepted connection");
                return Ok(Some(stream));
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                    return Ok(None);
                }
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => return Err(io_error("accept failed", err)),
        }
    }
    Ok(None)
}

fn lock(writer: &SharedWriter) -> MutexGuard<'_, FrameWriter<TcpStream>> {
    writer.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Answer requests on one connection until the client leaves.
fn serve(command: TcpStream, live: TcpStream, interval: Duration, running: &AtomicBool) -> scopelink_frame::Result<()> {
    command.set_read_timeout(Some(READ_POLL))?;
    let writer: SharedWriter = Arc::new(Mutex::new(FrameWriter::new(command.try_clone()?)));
    let active = Arc::new(AtomicBool::new(true));
    let notifier = spawn_notifier(Arc::clone(&writer), live, interval, Arc::clone(&active))?;

    let mut reader = FrameReader::new(command);
    let result = loop {
        if !running.load(Ordering::SeqCst) {
            break Ok(());
        }
        match reader.poll_frame() {
            Ok(None) => {}
            Ok(Some(ReadEvent::Frame(request))) => {
                debug!(code = request.command_code, "answering request");
                if let Err(err) = lock(&writer).write_message(&reply_for(&request)) {
                    break Err(err);
                }
            }
            Ok(Some(ReadEvent::Invalid(_))) => warn!("ignoring frame with invalid markers"),
            Err(FrameError::ConnectionClosed) => break Ok(()),
            Err(err) => break Err(err),
        }
    };

    active.store(false, Ordering::SeqCst);
    if notifier.join().is_err() {
        warn!("notifier thread panicked");
    }
    result
}

fn spawn_notifier(
    writer: SharedWriter,
    mut live: TcpStream,
    interval: Duration,
    active: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("simulator-notify".to_string())
        .spawn(move || {
            let mut tick = 0u32;
            let mut next = Instant::now() + interval;
            while active.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now < next {
                    thread::sleep((next - now).min(ACCEPT_POLL));
                    continue;
                }
                next += interval;
                tick = tick.wrapping_add(1);

                if let Err(err) = lock(&writer).write_message(&state_notification(tick)) {
                    debug!(error = %err, "notifier stopped");
                    break;
                }
                // One sample per tick on the live channel.
                if live.write_all(&tick.to_le_bytes()).is_err() {
                    debug!("live channel closed");
                }
            }
        })
}

fn state_notification(tick: u32) -> Message {
    let state = STATES[tick as usize % STATES.len()];
    Message::new(SYSTEM_STATE_CHANGED)
        .with_int_data([tick as i32, 0, 0])
        .with_payload(state.as_bytes())
}

/// Same code, status 0, request fields echoed back.
fn reply_for(request: &Message) -> Message {
    let mut reply = Message::new(request.command_code)
        .with_status(0)
        .with_ids(request.hardware_id, request.subsystem_id, request.client_id)
        .with_int_data(request.int_data)
        .with_value(request.value);

    reply = match request.command_code {
        SYSTEM_STATE_GET => reply.with_payload(STATES[0].as_bytes()),
        STAGE_POSITION_GET => reply.with_payload(b"X=0.000\nY=0.000\nZ=0.000"),
        _ => reply.with_payload(b"OK"),
    };
    if let Some(data) = &request.additional_data {
        reply = reply.with_additional_data(data.clone());
    }
    reply
}
