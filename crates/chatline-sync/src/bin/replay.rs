//! Chatline Replay - feed a scripted session through the reconciler
//!
//! Usage:
//!   chatline-replay script.jsonl
//!   cat script.jsonl | chatline-replay --viewer alice
//!
//! Each line of the script is one step:
//!
//! ```text
//! {"step":"open","channel_id":"general"}
//! {"step":"page","channel_id":"general","messages":[...]}
//! {"step":"cursor","channel_id":"general","last_read":"2024-01-01T00:00:00Z"}
//! {"step":"send","channel_id":"general","body":"hello"}
//! {"step":"event","event":{"type":"message_created","message":{...}}}
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chatline_logging::{ChatlineSubscriberBuilder, LogConfig, SessionContextGuard};
use chatline_sync::{
    ChannelId, HistoryStatus, Message, RealtimeEvent, Reconciler, SyncConfig, SyncError,
    TimelineRow, UserId,
};
use chrono::{DateTime, Utc};
use clap::Parser;
use serde::Deserialize;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "chatline-replay")]
#[command(about = "Replay a scripted chat session and print the merged timelines")]
struct Args {
    /// Script file; reads stdin when omitted
    file: Option<PathBuf>,

    /// Viewing user
    #[arg(short, long, default_value = "me")]
    viewer: String,

    /// History page size
    #[arg(long, default_value_t = chatline_sync::config::DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Human-readable logs instead of JSONL
    #[arg(long)]
    pretty: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
enum Step {
    Open {
        channel_id: ChannelId,
    },
    Close {
        channel_id: ChannelId,
    },
    /// Newest-first page; initial if the channel has none yet, older otherwise
    Page {
        channel_id: ChannelId,
        messages: Vec<Message>,
    },
    Cursor {
        channel_id: ChannelId,
        last_read: Option<DateTime<Utc>>,
    },
    Send {
        channel_id: ChannelId,
        body: String,
    },
    Event {
        event: RealtimeEvent,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut log_config = if args.pretty {
        LogConfig::development()
    } else {
        LogConfig::default()
    };
    log_config.default_level = args.log_level.clone();
    let _log_guard = ChatlineSubscriberBuilder::new().with_config(log_config).init();

    let viewer = UserId::new(args.viewer.clone());
    let _ctx = SessionContextGuard::new(viewer.as_str());
    let span = SessionContextGuard::span();
    let _entered = span.enter();

    let config = SyncConfig::default().page_size(args.page_size);
    config.validate()?;
    let mut reconciler = Reconciler::new(viewer, &config);

    let reader: Box<dyn BufRead> = match &args.file {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut channels = BTreeSet::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let step: Step = serde_json::from_str(&line)
            .with_context(|| format!("line {}: invalid step", lineno + 1))?;
        if let Some(channel_id) = apply(&mut reconciler, step)
            .with_context(|| format!("line {}", lineno + 1))?
        {
            channels.insert(channel_id);
        }
    }

    for channel_id in channels {
        print_channel(&reconciler, &channel_id);
    }
    println!("total unread: {}", reconciler.total_unread());
    Ok(())
}

fn apply(reconciler: &mut Reconciler, step: Step) -> Result<Option<ChannelId>> {
    let channel_id = match step {
        Step::Open { channel_id } => {
            reconciler.open_channel(&channel_id, Utc::now());
            channel_id
        }
        Step::Close { channel_id } => {
            reconciler.close_channel(&channel_id);
            channel_id
        }
        Step::Page {
            channel_id,
            messages,
        } => {
            // the first page of an open channel is its initial load
            let ticket = if reconciler.view(&channel_id).status == HistoryStatus::Ready {
                match reconciler.begin_older(&channel_id)? {
                    Some(ticket) => ticket,
                    None => bail!("channel {channel_id} has no older history to load"),
                }
            } else {
                reconciler.retry(&channel_id)?
            };
            match reconciler.complete_load(&ticket, Ok(messages)) {
                Ok(_) | Err(SyncError::StaleResponseDiscarded { .. }) => {}
                Err(e) => return Err(e.into()),
            }
            channel_id
        }
        Step::Cursor {
            channel_id,
            last_read,
        } => {
            reconciler.complete_cursor_fetch(&channel_id, Ok(last_read))?;
            channel_id
        }
        Step::Send { channel_id, body } => {
            reconciler.add_pending(&channel_id, body);
            channel_id
        }
        Step::Event { event } => {
            let channel_id = event.channel_id().cloned();
            reconciler.apply(event);
            return Ok(channel_id);
        }
    };
    Ok(Some(channel_id))
}

fn print_channel(reconciler: &Reconciler, channel_id: &ChannelId) {
    let view = reconciler.view(channel_id);
    println!(
        "# {}{} (unread {}, {:?}{})",
        channel_id,
        if reconciler.is_open(channel_id) { " [open]" } else { "" },
        view.unread,
        view.status,
        if view.has_previous { ", more history" } else { "" }
    );
    for row in view.rows() {
        match row {
            TimelineRow::Divider => println!("  ---- new messages ----"),
            TimelineRow::Confirmed(m) => {
                println!("  {} {:<10} {}", m.timestamp.to_rfc3339(), m.sender_id, m.body)
            }
            TimelineRow::Pending(p) => {
                println!(
                    "  {} {:<10} {} [{:?}]",
                    p.timestamp.to_rfc3339(),
                    "(you)",
                    p.body,
                    p.status
                )
            }
        }
    }
}
