//! Operator command set
//!
//! Commands arrive from the RPC layer as tagged JSON and are drained
//! serially by the main loop. The tagged enum is the command registry:
//! unknown names fail at parse time and are reported as a failed command
//! without touching the workflow.

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;

/// One operator mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "kebab-case")]
pub enum Command {
    /// Set a stop condition, or drop a flow.
    Stop {
        #[serde(default)]
        mode: Option<String>,
        #[serde(default)]
        cycle_point: Option<String>,
        /// ISO-8601 wall-clock time; the legacy slash form is not accepted.
        #[serde(default)]
        clock_time: Option<String>,
        #[serde(default)]
        task: Option<String>,
        #[serde(default)]
        flow_num: Option<u32>,
    },
    Pause,
    Resume,
    Hold {
        tasks: Vec<String>,
    },
    Release {
        tasks: Vec<String>,
    },
    SetHoldPoint {
        point: String,
    },
    ReleaseHoldPoint,
    PollTasks {
        tasks: Vec<String>,
    },
    KillTasks {
        tasks: Vec<String>,
    },
    RemoveTasks {
        tasks: Vec<String>,
    },
    ForceTriggerTasks {
        tasks: Vec<String>,
        #[serde(default)]
        flow: Vec<String>,
        #[serde(default)]
        flow_wait: bool,
        #[serde(default)]
        flow_descr: Option<String>,
    },
    /// Spawn downstream tasks as if the named outputs had been emitted.
    ForceSpawnChildren {
        tasks: Vec<String>,
        outputs: Vec<String>,
        #[serde(default)]
        flow_num: Option<u32>,
    },
    ReloadWorkflow,
    SetVerbosity {
        level: String,
    },
}

impl Command {
    /// Command name as it appears on the wire and in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Stop { .. } => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Hold { .. } => "hold",
            Command::Release { .. } => "release",
            Command::SetHoldPoint { .. } => "set-hold-point",
            Command::ReleaseHoldPoint => "release-hold-point",
            Command::PollTasks { .. } => "poll-tasks",
            Command::KillTasks { .. } => "kill-tasks",
            Command::RemoveTasks { .. } => "remove-tasks",
            Command::ForceTriggerTasks { .. } => "force-trigger-tasks",
            Command::ForceSpawnChildren { .. } => "force-spawn-children",
            Command::ReloadWorkflow => "reload-workflow",
            Command::SetVerbosity { .. } => "set-verbosity",
        }
    }

    /// Log-friendly rendering, `name(args...)`.
    pub fn describe(&self) -> String {
        let args = match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter(|(key, value)| key != "command" && !value.is_null())
                .map(|(key, value)| format!("{}={}", key, value))
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        };
        format!("{}({})", self.name(), args)
    }

    /// Parse a command from its wire form.
    pub fn from_json(json: &str) -> Result<Command, WorkflowError> {
        serde_json::from_str(json).map_err(|e| WorkflowError::CommandFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stop_with_mode() {
        let cmd = Command::from_json(r#"{"command":"stop","mode":"clean"}"#).unwrap();
        assert_eq!(
            cmd,
            Command::Stop {
                mode: Some("clean".into()),
                cycle_point: None,
                clock_time: None,
                task: None,
                flow_num: None,
            }
        );
    }

    #[test]
    fn test_parse_unknown_command_fails() {
        let err = Command::from_json(r#"{"command":"self-destruct"}"#).unwrap_err();
        assert!(matches!(err, WorkflowError::CommandFailed(_)));
    }

    #[test]
    fn test_describe_skips_null_args() {
        let cmd = Command::Stop {
            mode: Some("clean".into()),
            cycle_point: None,
            clock_time: None,
            task: None,
            flow_num: None,
        };
        assert_eq!(cmd.describe(), r#"stop(mode="clean")"#);
        assert_eq!(Command::Pause.describe(), "pause()");
    }

    #[test]
    fn test_trigger_roundtrip() {
        let cmd = Command::ForceTriggerTasks {
            tasks: vec!["1/foo".into()],
            flow: vec!["new".into()],
            flow_wait: false,
            flow_descr: Some("manual".into()),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(Command::from_json(&json).unwrap(), cmd);
    }
}
