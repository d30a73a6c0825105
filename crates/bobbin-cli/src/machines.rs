//! Demo WorkItem types registered by the `bobbin` binary.
//!
//! - `archive.snapshot.v1`: queued → started → sealed
//! - `archive.result.v1`: runs `payload.cmd` in a shell and ends in `succeeded`
//!   or `failed`. A failed run is re-queued as is, up to `max_requeues` times
//!   (default 3), and is claimable again on the next poll.

use std::process::Stdio;

use async_trait::async_trait;
use bobbin_core::domain::{DefinitionError, HookError, WorkItem};
use bobbin_core::machine::{HookContext, RegistryError, TransitionHook};
use bobbin_core::{EngineBuilder, StateMachine, Transition};
use serde_json::{Map, Value, json};
use tokio::process::Command;
use tracing::info;

pub const SNAPSHOT: &str = "archive.snapshot.v1";
pub const RESULT: &str = "archive.result.v1";

/// Output kept in the payload is cut to this many bytes.
const MAX_OUTPUT_BYTES: usize = 4 * 1024;
const DEFAULT_MAX_REQUEUES: u64 = 3;

pub fn register_all(builder: EngineBuilder) -> Result<EngineBuilder, RegistryError> {
    builder
        .register(snapshot_machine()?)?
        .register(result_machine()?)
}

/// Payload fields of `item`; hooks only write into object payloads.
fn fields(item: &mut WorkItem) -> Result<&mut Map<String, Value>, HookError> {
    item.payload
        .as_object_mut()
        .ok_or_else(|| HookError::new("payload is not a JSON object"))
}

pub fn snapshot_machine() -> Result<StateMachine, DefinitionError> {
    StateMachine::builder(SNAPSHOT)
        .initial("queued")
        .active("started")
        .final_state("sealed")
        .transition(
            Transition::new("started", "sealed")
                .named("seal")
                .hook_fn(|item, ctx| {
                    fields(item)?.insert("sealed_at".into(), json!(ctx.now.to_rfc3339()));
                    Ok(())
                }),
        )
        .build()
}

fn exit_code(item: &WorkItem) -> Option<i64> {
    item.payload.get("exit_code").and_then(Value::as_i64)
}

fn requeues(item: &WorkItem) -> u64 {
    item.payload.get("requeues").and_then(Value::as_u64).unwrap_or(0)
}

fn max_requeues(item: &WorkItem) -> u64 {
    item.payload
        .get("max_requeues")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_REQUEUES)
}

pub fn result_machine() -> Result<StateMachine, DefinitionError> {
    StateMachine::builder(RESULT)
        .initial("queued")
        .active("started")
        .state("executed")
        .final_state("succeeded")
        .final_state("failed")
        .transition(
            Transition::new("started", "executed")
                .named("execute")
                .when(|item| exit_code(item).is_none())
                .hook(RunCommand),
        )
        .transition(
            Transition::new("started", "succeeded")
                .named("succeed")
                .when(|item| exit_code(item) == Some(0)),
        )
        .transition(
            Transition::new("started", "queued")
                .named("requeue")
                .when(|item| requeues(item) < max_requeues(item))
                .hook_fn(|item, _| {
                    let count = requeues(item) + 1;
                    let payload = fields(item)?;
                    payload.insert("requeues".into(), json!(count));
                    payload.remove("exit_code");
                    Ok(())
                }),
        )
        .transition(Transition::new("started", "failed").named("give_up"))
        .build()
}

/// Runs `payload.cmd` with `sh -c` and records its exit code and output.
struct RunCommand;

#[async_trait]
impl TransitionHook for RunCommand {
    async fn run(&self, item: &mut WorkItem, _ctx: &HookContext) -> Result<(), HookError> {
        let cmd = item
            .payload
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or_else(|| HookError::new("payload has no string field 'cmd'"))?
            .to_string();

        let output = Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HookError::new(format!("failed to run '{cmd}': {e}")))?;

        let code = output.status.code().unwrap_or(-1);
        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if stdout.len() > MAX_OUTPUT_BYTES {
            let mut cut = MAX_OUTPUT_BYTES;
            while !stdout.is_char_boundary(cut) {
                cut -= 1;
            }
            stdout.truncate(cut);
        }
        info!(item_id = %item.id, cmd = %cmd, exit_code = code, "command finished");

        let payload = fields(item)?;
        payload.insert("exit_code".into(), json!(code));
        payload.insert("output".into(), json!(stdout));
        Ok(())
    }
}
