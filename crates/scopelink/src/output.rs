use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use scopelink_client::EngineStats;
use scopelink_frame::{code_name, Message};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct MessageOutput<'a> {
    code: u32,
    name: &'a str,
    status: u32,
    ok: bool,
    hardware_id: u32,
    subsystem_id: u32,
    client_id: u32,
    int_data: [i32; 3],
    flags: u32,
    value: f64,
    payload: String,
    additional_data_size: u32,
    received_at: f64,
}

impl<'a> MessageOutput<'a> {
    fn new(message: &'a Message) -> Self {
        Self {
            code: message.command_code,
            name: code_name(message.command_code),
            status: message.status_code,
            ok: message.is_ok(),
            hardware_id: message.hardware_id,
            subsystem_id: message.subsystem_id,
            client_id: message.client_id,
            int_data: message.int_data,
            flags: message.flags,
            value: message.value(),
            payload: message.payload_str(),
            additional_data_size: message.additional_data_size,
            received_at: unix_seconds(message.received_at),
        }
    }
}

pub fn print_message(message: &Message, format: OutputFormat) {
    let out = MessageOutput::new(message);
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (a, b, c) = message.int_triple();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CODE", "NAME", "STATUS", "DATA", "VALUE", "PAYLOAD"])
                .add_row(vec![
                    format!("{:#06x}", out.code),
                    out.name.to_string(),
                    out.status.to_string(),
                    format!("{a}, {b}, {c}"),
                    out.value.to_string(),
                    out.payload.clone(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "code={:#06x} ({}) status={} value={} payload={:?} extra={}",
                out.code, out.name, out.status, out.value, out.payload, out.additional_data_size
            );
        }
    }
}

pub fn print_stats(stats: &EngineStats, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(stats).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["METRIC", "VALUE"]);
            for (name, value) in stats_rows(stats) {
                table.add_row(vec![name.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (name, value) in stats_rows(stats) {
                println!("{name:<28} {value}");
            }
        }
    }
}

fn stats_rows(stats: &EngineStats) -> Vec<(&'static str, String)> {
    let reader = &stats.reader;
    let dispatcher = &stats.dispatcher;
    vec![
        ("connected", stats.connected.to_string()),
        ("reader.state", format!("{:?}", stats.reader_state)),
        ("reader.messages_read", reader.messages_read.to_string()),
        ("reader.bytes_read", reader.bytes_read.to_string()),
        ("reader.invalid_frames", reader.invalid_frames.to_string()),
        ("reader.parse_errors", reader.parse_errors.to_string()),
        ("reader.socket_errors", reader.socket_errors.to_string()),
        ("reader.resync_attempts", reader.resync_attempts.to_string()),
        ("reader.resync_successes", reader.resync_successes.to_string()),
        ("dispatcher.received", dispatcher.messages_received.to_string()),
        ("dispatcher.responses", dispatcher.responses_dispatched.to_string()),
        ("dispatcher.callbacks", dispatcher.callbacks_dispatched.to_string()),
        ("dispatcher.queued", dispatcher.unsolicited_queued.to_string()),
        ("dispatcher.dropped", dispatcher.messages_dropped.to_string()),
        ("unsolicited.pending", stats.unsolicited_pending.to_string()),
    ]
}

fn unix_seconds(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| (d.as_secs_f64() * 1000.0).round() / 1000.0)
        .unwrap_or(0.0)
}
