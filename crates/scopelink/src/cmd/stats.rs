use std::thread;
use std::time::Duration;

use scopelink_client::ClientConfig;
use tracing::warn;

use crate::cmd::{connect, parse_duration, StatsArgs};
use crate::exit::{client_error, CliResult, SUCCESS};
use crate::output::{print_stats, OutputFormat};

/// Time for frames already on the wire to reach the counters.
const SETTLE: Duration = Duration::from_millis(100);

pub fn run(args: StatsArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let client = connect(&args.ip, args.port, ClientConfig::default())?;

    if let Some(code) = args.probe_code {
        let reply = client
            .request(code, &[], 0.0, &[], timeout)
            .map_err(|err| client_error("probe failed", err))?;
        if reply.is_timeout() {
            warn!(code, ?timeout, "probe request timed out");
        }
    }

    thread::sleep(SETTLE);
    print_stats(&client.stats(), format);
    client.disconnect();
    Ok(SUCCESS)
}
