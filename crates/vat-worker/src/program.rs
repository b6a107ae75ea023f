//! Vat programs the worker knows how to host.
//!
//! A bundle names its program as `{"moduleFormat": "builtin", "name": ...}`.
//! Programs are deterministic: their only inputs are the delivery, the vat
//! parameters, restored state, and syscall results.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use vat_worker_protocol::{ProtocolError, ProtocolResult};

/// Worker-side view of the syscall channel back to the runtime.
pub trait SyscallPort {
    fn syscall(&mut self, request: Value) -> ProtocolResult<Value>;
    fn console(&mut self, level: &str, args: Vec<Value>) -> ProtocolResult<()>;
    fn test_log(&mut self, args: Vec<Value>) -> ProtocolResult<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The vat itself failed; reported to the runtime as an error delivery result.
    #[error("{0}")]
    Vat(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, thiserror::Error)]
pub enum ProgramError {
    #[error("unsupported module format {0:?}")]
    UnsupportedFormat(String),
    #[error("unknown builtin program {0:?}")]
    UnknownProgram(String),
    #[error("invalid state for {program}: {reason}")]
    InvalidState { program: String, reason: String },
}

pub trait VatProgram: Send {
    fn deliver(&mut self, delivery: &Value, port: &mut dyn SyscallPort)
    -> Result<(), DeliveryError>;

    /// Heap state captured in snapshots.
    fn state(&self) -> Value;
}

/// Contents of a raw heap snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub vat_id: String,
    pub bundle: Value,
    pub vat_parameters: Value,
    pub state: Value,
}

/// Instantiate the program a bundle names, optionally restoring heap state.
pub fn instantiate(
    bundle: &Value,
    vat_parameters: &Value,
    state: Option<&Value>,
) -> Result<Box<dyn VatProgram>, ProgramError> {
    let format = bundle
        .get("moduleFormat")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if format != "builtin" {
        return Err(ProgramError::UnsupportedFormat(format.to_string()));
    }
    let name = bundle.get("name").and_then(Value::as_str).unwrap_or_default();
    match name {
        "counter" => Ok(Box::new(Counter::new(vat_parameters, state)?)),
        "inert" => Ok(Box::new(Inert)),
        other => Err(ProgramError::UnknownProgram(other.to_string())),
    }
}

/// Accepts every delivery and makes no syscalls.
struct Inert;

impl VatProgram for Inert {
    fn deliver(
        &mut self,
        _delivery: &Value,
        _port: &mut dyn SyscallPort,
    ) -> Result<(), DeliveryError> {
        Ok(())
    }

    fn state(&self) -> Value {
        Value::Null
    }
}

/// Counter vat whose behaviour depends on heap state, so a vat restored from
/// the wrong snapshot issues different syscalls than the transcript recorded.
struct Counter {
    count: i64,
    last_read: Value,
}

impl Counter {
    fn new(vat_parameters: &Value, state: Option<&Value>) -> Result<Self, ProgramError> {
        match state {
            Some(state) => {
                let count = state.get("count").and_then(Value::as_i64).ok_or_else(|| {
                    ProgramError::InvalidState {
                        program: "counter".into(),
                        reason: "missing count".into(),
                    }
                })?;
                Ok(Self {
                    count,
                    last_read: state.get("lastRead").cloned().unwrap_or(Value::Null),
                })
            }
            None => Ok(Self {
                count: vat_parameters
                    .get("start")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                last_read: Value::Null,
            }),
        }
    }

    fn call(
        &mut self,
        method: &str,
        args: &[Value],
        port: &mut dyn SyscallPort,
    ) -> Result<(), DeliveryError> {
        match method {
            "increment" => {
                let step = args.first().and_then(Value::as_i64).unwrap_or(1);
                self.count = self
                    .count
                    .checked_add(step)
                    .ok_or_else(|| DeliveryError::Vat(format!("counter overflow adding {step}")))?;
                let result =
                    port.syscall(json!(["vatstoreSet", "count", self.count.to_string()]))?;
                check_ok(&result)?;
            }
            "read" => {
                let result = port.syscall(json!(["vatstoreGet", "count"]))?;
                check_ok(&result)?;
                self.last_read = result.get(1).cloned().unwrap_or(Value::Null);
            }
            // Adopt the stored count, so later syscalls depend on the answer.
            "reload" => {
                let result = port.syscall(json!(["vatstoreGet", "count"]))?;
                check_ok(&result)?;
                let stored = result
                    .get(1)
                    .and_then(Value::as_str)
                    .and_then(|text| text.parse().ok());
                if let Some(count) = stored {
                    self.count = count;
                }
            }
            "send" => {
                let target = args.first().cloned().unwrap_or(Value::Null);
                let method = args.get(1).cloned().unwrap_or_else(|| json!("ping"));
                let result = port.syscall(json!([
                    "send",
                    target,
                    { "methargs": { "method": method, "args": [self.count] }, "result": null }
                ]))?;
                check_ok(&result)?;
            }
            "log" => {
                port.console("info", args.to_vec())?;
                port.test_log(args.to_vec())?;
            }
            "exit" => {
                let info = args.first().cloned().unwrap_or(Value::Null);
                let result = port.syscall(json!(["exit", false, info]))?;
                check_ok(&result)?;
            }
            "fail" => return Err(DeliveryError::Vat("counter asked to fail".into())),
            other => {
                return Err(DeliveryError::Vat(format!(
                    "counter has no method {other:?}"
                )));
            }
        }
        Ok(())
    }
}

fn check_ok(result: &Value) -> Result<(), DeliveryError> {
    match result.get(0).and_then(Value::as_str) {
        Some("ok") => Ok(()),
        _ => Err(DeliveryError::Vat(format!("syscall failed: {result}"))),
    }
}

impl VatProgram for Counter {
    fn deliver(
        &mut self,
        delivery: &Value,
        port: &mut dyn SyscallPort,
    ) -> Result<(), DeliveryError> {
        // ["message", target, { methargs: { method, args } }]
        if delivery.get(0).and_then(Value::as_str) != Some("message") {
            return Ok(());
        }
        let methargs = delivery
            .get(2)
            .and_then(|msg| msg.get("methargs"))
            .ok_or_else(|| DeliveryError::Vat("message without methargs".into()))?;
        let method = methargs
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| DeliveryError::Vat("message without method".into()))?
            .to_string();
        let args = methargs
            .get("args")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        self.call(&method, &args, port)
    }

    fn state(&self) -> Value {
        json!({ "count": self.count, "lastRead": self.last_read })
    }
}
