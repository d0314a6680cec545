use scopelink_client::{ClientConfig, Reply};
use scopelink_frame::{code_name, Message};

use crate::cmd::{connect, parse_duration, SendArgs};
use crate::exit::{client_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT};
use crate::output::{print_message, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let client = connect(&args.ip, args.port, ClientConfig::default())?;

    let data = args.data.as_deref().map(str::as_bytes).unwrap_or_default();
    let reply = client
        .request(args.code, &args.params, args.value, data, timeout)
        .map_err(|err| client_error("request failed", err))?;
    client.disconnect();

    match reply {
        Reply::Received(message) => {
            print_message(&message, format);
            Ok(reply_exit_code(&message))
        }
        Reply::TimedOut { code, after } => Err(CliError::new(
            TIMEOUT,
            format!("no reply for {} ({code:#x}) within {after:?}", code_name(code)),
        )),
    }
}

/// A reply with a non-zero controller status is a failed command.
fn reply_exit_code(message: &Message) -> i32 {
    if message.is_ok() {
        SUCCESS
    } else {
        FAILURE
    }
}
