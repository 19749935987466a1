//! Stdin event feed.
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"sample","address":"10.0.0.1","cpu_util":72.0,"cpu_idle":28.0}
//! {"type":"start"}
//! {"type":"join","id":3,"address":"10.0.0.4","capacity":2.0}
//! {"type":"leave","id":1}
//! {"type":"shutdown"}
//! ```
//!
//! Blank lines and lines starting with `#` are ignored. Malformed lines are
//! logged and skipped.

use std::io::BufRead;
use std::net::IpAddr;

use serde::Deserialize;
use tracing::{debug, info, warn};

use rebal_controller::{ControlEvent, ControllerHandle};
use rebal_core::{MachineId, MachineInfo, UtilizationSample};
use rebal_membership::MembershipChange;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedEvent {
    Sample {
        address: IpAddr,
        cpu_util: f64,
        cpu_idle: f64,
    },
    Start,
    Join {
        id: MachineId,
        address: IpAddr,
        #[serde(default = "default_capacity")]
        capacity: f64,
    },
    Leave {
        id: MachineId,
    },
    Shutdown,
}

fn default_capacity() -> f64 {
    1.0
}

impl FeedEvent {
    /// Parse one feed line. Returns `Ok(None)` for blank and comment lines.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(line)?))
    }

    /// The controller event this line maps to. `Shutdown` has none.
    pub fn into_control_event(self) -> Option<ControlEvent> {
        match self {
            FeedEvent::Sample {
                address,
                cpu_util,
                cpu_idle,
            } => Some(ControlEvent::Sample(UtilizationSample::new(
                cpu_util, cpu_idle, address,
            ))),
            FeedEvent::Start => Some(ControlEvent::Start),
            FeedEvent::Join {
                id,
                address,
                capacity,
            } => Some(ControlEvent::Membership(MembershipChange::Joined(
                MachineInfo::new(id, address).with_capacity(capacity),
            ))),
            FeedEvent::Leave { id } => Some(ControlEvent::Membership(MembershipChange::Left { id })),
            FeedEvent::Shutdown => None,
        }
    }
}

/// Forward every event in `reader` to the controller until EOF or a
/// `shutdown` line. Returns the number of events forwarded.
pub fn pump<R: BufRead>(reader: R, handle: &ControllerHandle) -> usize {
    let mut forwarded = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "event feed read failed");
                break;
            }
        };
        let event = match FeedEvent::parse(&line) {
            Ok(Some(event)) => event,
            Ok(None) => continue,
            Err(e) => {
                warn!(line = idx + 1, error = %e, "malformed feed line skipped");
                continue;
            }
        };
        debug!(line = idx + 1, ?event, "feed event");
        match event.into_control_event() {
            Some(event) => {
                handle.send(event);
                forwarded += 1;
            }
            None => {
                info!("shutdown requested by feed");
                handle.shutdown();
                return forwarded;
            }
        }
    }
    debug!(forwarded, "event feed closed");
    forwarded
}

/// Read stdin on a dedicated thread; stdin reads block and must not hold a
/// runtime worker.
pub fn spawn_stdin_reader(handle: ControllerHandle) -> std::io::Result<std::thread::JoinHandle<usize>> {
    std::thread::Builder::new()
        .name("rebald-feed".into())
        .spawn(move || pump(std::io::stdin().lock(), &handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use rebal_controller::{ControllerSettings, ReconfigurationController};

    fn handle() -> ControllerHandle {
        ReconfigurationController::new(
            vec![0],
            0,
            ControllerSettings {
                config_path: "unused.toml".into(),
                estimates_path: None,
            },
        )
        .handle()
    }

    #[test]
    fn parses_every_event_kind() {
        let sample =
            FeedEvent::parse(r#"{"type":"sample","address":"10.0.0.1","cpu_util":3,"cpu_idle":1}"#)
                .unwrap()
                .unwrap();
        assert_eq!(
            sample.into_control_event(),
            Some(ControlEvent::Sample(UtilizationSample::new(
                3.0,
                1.0,
                "10.0.0.1".parse().unwrap()
            )))
        );

        let join = FeedEvent::parse(r#"{"type":"join","id":4,"address":"10.0.0.5"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            join,
            FeedEvent::Join {
                id: 4,
                address: "10.0.0.5".parse().unwrap(),
                capacity: 1.0
            }
        );

        assert_eq!(
            FeedEvent::parse(r#"{"type":"leave","id":2}"#).unwrap(),
            Some(FeedEvent::Leave { id: 2 })
        );
        assert_eq!(
            FeedEvent::parse(r#"{"type":"start"}"#).unwrap(),
            Some(FeedEvent::Start)
        );
        assert_eq!(
            FeedEvent::parse(r#"{"type":"shutdown"}"#)
                .unwrap()
                .unwrap()
                .into_control_event(),
            None
        );
    }

    #[test]
    fn blank_and_comment_lines_are_skipped() {
        assert_eq!(FeedEvent::parse("").unwrap(), None);
        assert_eq!(FeedEvent::parse("   # note").unwrap(), None);
    }

    #[test]
    fn unknown_type_is_an_error() {
        assert!(FeedEvent::parse(r#"{"type":"reboot"}"#).is_err());
        assert!(FeedEvent::parse("not json").is_err());
    }

    #[test]
    fn pump_skips_bad_lines_and_stops_at_shutdown() {
        let input = "\
{\"type\":\"start\"}
garbage
# comment
{\"type\":\"leave\",\"id\":1}
{\"type\":\"shutdown\"}
{\"type\":\"start\"}
";
        assert_eq!(pump(Cursor::new(input), &handle()), 2);
    }
}
