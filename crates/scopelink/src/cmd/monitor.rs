use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use scopelink_client::{ClientConfig, DispatcherConfig, ReaderState};
use scopelink_frame::UNSOLICITED_CODES;
use tracing::info;

use crate::cmd::{connect, install_ctrlc_handler, parse_duration, MonitorArgs};
use crate::exit::{CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_message, OutputFormat};

const POLL: Duration = Duration::from_millis(200);

pub fn run(args: MonitorArgs, format: OutputFormat) -> CliResult<i32> {
    let deadline = args
        .duration
        .as_deref()
        .map(parse_duration)
        .transpose()?
        .map(|duration| Instant::now() + duration);

    // Only the requested codes are queued; everything else is dropped.
    let codes = args.codes.unwrap_or_else(|| UNSOLICITED_CODES.to_vec());
    let config = ClientConfig::default()
        .with_dispatcher(DispatcherConfig::default().with_unsolicited_codes(codes));
    let client = connect(&args.ip, args.port, config)?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let mut printed = 0usize;
    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            break;
        }

        let Some(message) = client.recv_unsolicited(POLL) else {
            if client.reader_state() == ReaderState::Stopped {
                return Err(CliError::new(FAILURE, "instrument closed the connection"));
            }
            continue;
        };

        print_message(&message, format);
        printed = printed.saturating_add(1);
        if args.count.is_some_and(|count| printed >= count) {
            break;
        }
    }

    client.disconnect();
    info!(printed, "monitor finished");
    Ok(SUCCESS)
}
