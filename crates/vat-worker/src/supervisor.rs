use crate::program::{DeliveryError, SyscallPort, VatProgram, WorkerSnapshot, instantiate};
use serde_json::{Value, json};
use std::{
    fs,
    io::{Read, Write},
};
use vat_codec::to_canonical_cbor;
use vat_worker_protocol::{
    FromWorker, ManagerRequest, ProtocolError, ProtocolResult, ToWorker, WorkerReply,
    WorkerUpcall,
    frame::{read_frame, write_frame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Uninitialized,
    Ready,
    Delivering,
    Terminated,
}

struct InstalledVat {
    vat_id: String,
    bundle: Value,
    vat_parameters: Value,
    program: Box<dyn VatProgram>,
}

/// Worker-side dispatch state machine for a single vat.
pub struct Supervisor {
    state: DispatchState,
    vat: Option<InstalledVat>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            state: DispatchState::Uninitialized,
            vat: None,
        }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub fn vat_id(&self) -> Option<&str> {
        self.vat.as_ref().map(|vat| vat.vat_id.as_str())
    }

    /// Handle one request. Vat-level failures become error replies; protocol
    /// misuse is returned as `Err`.
    pub fn handle(
        &mut self,
        request: ManagerRequest,
        port: &mut dyn SyscallPort,
    ) -> ProtocolResult<WorkerReply> {
        match request {
            ManagerRequest::SetBundle {
                vat_id,
                bundle,
                vat_parameters,
                virtual_object_cache_size,
            } => {
                self.require_uninitialized()?;
                tracing::debug!(%vat_id, ?virtual_object_cache_size, "setBundle");
                self.install(vat_id, bundle, vat_parameters, None)
            }
            ManagerRequest::LoadSnapshot { vat_id, path } => {
                self.require_uninitialized()?;
                let snapshot = match fs::read(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|bytes| {
                        serde_cbor::from_slice::<WorkerSnapshot>(&bytes).map_err(|e| e.to_string())
                    }) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        return Ok(WorkerReply::Error(format!(
                            "cannot load snapshot {}: {err}",
                            path.display()
                        )));
                    }
                };
                if snapshot.vat_id != vat_id {
                    tracing::warn!(
                        %vat_id,
                        snapshot_vat = %snapshot.vat_id,
                        "loading a snapshot taken from another vat"
                    );
                }
                self.install(
                    vat_id,
                    snapshot.bundle,
                    snapshot.vat_parameters,
                    Some(snapshot.state),
                )
            }
            ManagerRequest::Deliver(delivery) => self.deliver(&delivery, port),
            ManagerRequest::Snapshot { path } => {
                let vat = self.ready_vat("snapshot")?;
                let snapshot = WorkerSnapshot {
                    vat_id: vat.vat_id.clone(),
                    bundle: vat.bundle.clone(),
                    vat_parameters: vat.vat_parameters.clone(),
                    state: vat.program.state(),
                };
                let bytes = to_canonical_cbor(&snapshot)?;
                match fs::write(&path, bytes) {
                    Ok(()) => Ok(WorkerReply::Ok(Value::Null)),
                    Err(err) => Ok(WorkerReply::Error(format!(
                        "cannot write snapshot {}: {err}",
                        path.display()
                    ))),
                }
            }
            ManagerRequest::Shutdown => {
                self.state = DispatchState::Terminated;
                Ok(WorkerReply::Ok(Value::Null))
            }
        }
    }

    fn require_uninitialized(&self) -> ProtocolResult<()> {
        match self.state {
            DispatchState::Uninitialized => Ok(()),
            _ => Err(ProtocolError::AlreadyInitialized),
        }
    }

    fn ready_vat(&mut self, what: &str) -> ProtocolResult<&mut InstalledVat> {
        match (self.state, self.vat.as_mut()) {
            (DispatchState::Ready, Some(vat)) => Ok(vat),
            _ => Err(ProtocolError::NotReady(what.to_string())),
        }
    }

    fn install(
        &mut self,
        vat_id: String,
        bundle: Value,
        vat_parameters: Value,
        state: Option<Value>,
    ) -> ProtocolResult<WorkerReply> {
        match instantiate(&bundle, &vat_parameters, state.as_ref()) {
            Ok(program) => {
                self.vat = Some(InstalledVat {
                    vat_id,
                    bundle,
                    vat_parameters,
                    program,
                });
                self.state = DispatchState::Ready;
                Ok(WorkerReply::DispatchReady)
            }
            Err(err) => Ok(WorkerReply::Error(err.to_string())),
        }
    }

    fn deliver(
        &mut self,
        delivery: &Value,
        port: &mut dyn SyscallPort,
    ) -> ProtocolResult<WorkerReply> {
        self.ready_vat("deliver")?;
        self.state = DispatchState::Delivering;
        let mut counting = CountingPort { inner: port, syscalls: 0 };
        let outcome = match self.vat.as_mut() {
            Some(vat) => vat.program.deliver(delivery, &mut counting),
            None => Err(ProtocolError::NotReady("deliver".into()).into()),
        };
        let syscalls = counting.syscalls;
        match outcome {
            Ok(()) => {
                self.state = DispatchState::Ready;
                Ok(WorkerReply::Ok(json!(["ok", null, { "syscalls": syscalls }])))
            }
            Err(DeliveryError::Vat(message)) => {
                self.state = DispatchState::Ready;
                tracing::debug!(%message, "delivery failed inside the vat");
                Ok(WorkerReply::Ok(json!(["error", message, null])))
            }
            Err(DeliveryError::Protocol(err)) => {
                self.state = if err.is_fatal() {
                    DispatchState::Terminated
                } else {
                    DispatchState::Ready
                };
                Err(err)
            }
        }
    }
}

struct CountingPort<'a> {
    inner: &'a mut dyn SyscallPort,
    syscalls: u64,
}

impl SyscallPort for CountingPort<'_> {
    fn syscall(&mut self, request: Value) -> ProtocolResult<Value> {
        self.syscalls += 1;
        self.inner.syscall(request)
    }

    fn console(&mut self, level: &str, args: Vec<Value>) -> ProtocolResult<()> {
        self.inner.console(level, args)
    }

    fn test_log(&mut self, args: Vec<Value>) -> ProtocolResult<()> {
        self.inner.test_log(args)
    }
}

struct FramedPort<'a, R, W> {
    reader: &'a mut R,
    writer: &'a mut W,
}

impl<R: Read, W: Write> FramedPort<'_, R, W> {
    fn send(&mut self, message: FromWorker) -> ProtocolResult<()> {
        write_frame(&mut *self.writer, &message.encode()?)
    }
}

impl<R: Read, W: Write> SyscallPort for FramedPort<'_, R, W> {
    fn syscall(&mut self, request: Value) -> ProtocolResult<Value> {
        self.send(WorkerUpcall::Syscall(request).into())?;
        let Some(payload) = read_frame(&mut *self.reader)? else {
            return Err(ProtocolError::WorkerExited("manager".into()));
        };
        match ToWorker::decode(&payload)? {
            ToWorker::SyscallResult(result) => Ok(result),
            ToWorker::Request(request) => Err(ProtocolError::Malformed(format!(
                "expected a syscall result, got {request:?}"
            ))),
        }
    }

    fn console(&mut self, level: &str, args: Vec<Value>) -> ProtocolResult<()> {
        self.send(
            WorkerUpcall::Console {
                level: level.to_string(),
                args,
            }
            .into(),
        )
    }

    fn test_log(&mut self, args: Vec<Value>) -> ProtocolResult<()> {
        self.send(WorkerUpcall::TestLog(args).into())
    }
}

/// Serve requests until shutdown or end of input.
pub fn run_worker<R: Read, W: Write>(mut reader: R, mut writer: W) -> ProtocolResult<()> {
    let mut supervisor = Supervisor::new();
    while let Some(payload) = read_frame(&mut reader)? {
        let reply = match ToWorker::decode(&payload) {
            Ok(ToWorker::Request(request)) => {
                let mut port = FramedPort {
                    reader: &mut reader,
                    writer: &mut writer,
                };
                match supervisor.handle(request, &mut port) {
                    Ok(reply) => reply,
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => WorkerReply::Error(err.to_string()),
                }
            }
            Ok(ToWorker::SyscallResult(_)) => {
                WorkerReply::Error("syscall result with no syscall outstanding".into())
            }
            Err(ProtocolError::BadTag(tag)) => {
                tracing::warn!(%tag, "unrecognized request");
                WorkerReply::BadTag(tag)
            }
            Err(err) => return Err(err),
        };
        write_frame(&mut writer, &FromWorker::Reply(reply).encode()?)?;
        if supervisor.state() == DispatchState::Terminated {
            break;
        }
    }
    tracing::debug!(vat_id = ?supervisor.vat_id(), "worker loop finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{collections::VecDeque, io::Cursor};
    use tempfile::TempDir;

    #[derive(Default)]
    struct NoPort {
        answers: VecDeque<Value>,
    }

    impl SyscallPort for NoPort {
        fn syscall(&mut self, _request: Value) -> ProtocolResult<Value> {
            Ok(self.answers.pop_front().unwrap_or_else(|| json!(["ok", null])))
        }

        fn console(&mut self, _level: &str, _args: Vec<Value>) -> ProtocolResult<()> {
            Ok(())
        }

        fn test_log(&mut self, _args: Vec<Value>) -> ProtocolResult<()> {
            Ok(())
        }
    }

    fn set_bundle(vat_id: &str) -> ManagerRequest {
        ManagerRequest::SetBundle {
            vat_id: vat_id.into(),
            bundle: json!({ "moduleFormat": "builtin", "name": "counter" }),
            vat_parameters: json!({}),
            virtual_object_cache_size: None,
        }
    }

    fn increment() -> Value {
        json!(["message", "o+0", { "methargs": { "method": "increment", "args": [] } }])
    }

    fn frames(messages: &[ToWorker]) -> Cursor<Vec<u8>> {
        let mut buf = Vec::new();
        for message in messages {
            write_frame(&mut buf, &message.encode().unwrap()).unwrap();
        }
        Cursor::new(buf)
    }

    fn replies(output: Vec<u8>) -> Vec<FromWorker> {
        let mut cursor = Cursor::new(output);
        let mut out = Vec::new();
        while let Some(payload) = read_frame(&mut cursor).unwrap() {
            out.push(FromWorker::decode(&payload).unwrap());
        }
        out
    }

    #[test]
    fn deliver_before_set_bundle_is_not_ready() {
        let mut sup = Supervisor::new();
        let err = sup
            .handle(ManagerRequest::Deliver(increment()), &mut NoPort::default())
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotReady(_)));
        assert_eq!(sup.state(), DispatchState::Uninitialized);
    }

    #[test]
    fn bundle_installs_only_once() {
        let mut sup = Supervisor::new();
        let reply = sup.handle(set_bundle("v1"), &mut NoPort::default()).unwrap();
        assert_eq!(reply, WorkerReply::DispatchReady);
        assert_eq!(sup.state(), DispatchState::Ready);
        let err = sup.handle(set_bundle("v1"), &mut NoPort::default()).unwrap_err();
        assert!(matches!(err, ProtocolError::AlreadyInitialized));
    }

    #[test]
    fn vat_failure_is_a_delivery_result_not_a_protocol_error() {
        let mut sup = Supervisor::new();
        sup.handle(set_bundle("v1"), &mut NoPort::default()).unwrap();
        let fail = json!(["message", "o+0", { "methargs": { "method": "fail", "args": [] } }]);
        let reply = sup
            .handle(ManagerRequest::Deliver(fail), &mut NoPort::default())
            .unwrap();
        assert_eq!(
            reply,
            WorkerReply::Ok(json!(["error", "counter asked to fail", null]))
        );
        assert_eq!(sup.state(), DispatchState::Ready);
    }

    #[test]
    fn snapshot_round_trips_heap_state() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("heap.xss");
        let mut sup = Supervisor::new();
        sup.handle(set_bundle("v1"), &mut NoPort::default()).unwrap();
        sup.handle(ManagerRequest::Deliver(increment()), &mut NoPort::default())
            .unwrap();
        let reply = sup
            .handle(ManagerRequest::Snapshot { path: path.clone() }, &mut NoPort::default())
            .unwrap();
        assert_eq!(reply, WorkerReply::Ok(Value::Null));

        let mut restored = Supervisor::new();
        let reply = restored
            .handle(
                ManagerRequest::LoadSnapshot {
                    vat_id: "v1".into(),
                    path,
                },
                &mut NoPort::default(),
            )
            .unwrap();
        assert_eq!(reply, WorkerReply::DispatchReady);
        let reply = restored
            .handle(
                ManagerRequest::Snapshot {
                    path: tmp.path().join("again.xss"),
                },
                &mut NoPort::default(),
            )
            .unwrap();
        assert_eq!(reply, WorkerReply::Ok(Value::Null));
        let again: WorkerSnapshot =
            serde_cbor::from_slice(&fs::read(tmp.path().join("again.xss")).unwrap()).unwrap();
        assert_eq!(again.state["count"], json!(1));
    }

    #[test]
    fn loop_answers_bad_tags_and_services_syscalls() {
        let mut input = Vec::new();
        let bogus =
            vat_worker_protocol::frame::encode_payload(&[json!("frobnicate")]).unwrap();
        write_frame(&mut input, &bogus).unwrap();
        for message in [
            ToWorker::Request(set_bundle("v9")),
            ToWorker::Request(ManagerRequest::Deliver(increment())),
            ToWorker::SyscallResult(json!(["ok", null])),
            ToWorker::Request(ManagerRequest::Shutdown),
        ] {
            write_frame(&mut input, &message.encode().unwrap()).unwrap();
        }

        let mut output = Vec::new();
        run_worker(Cursor::new(input), &mut output).unwrap();
        assert_eq!(
            replies(output),
            vec![
                FromWorker::Reply(WorkerReply::BadTag("frobnicate".into())),
                FromWorker::Reply(WorkerReply::DispatchReady),
                FromWorker::Upcall(WorkerUpcall::Syscall(json!(["vatstoreSet", "count", "1"]))),
                FromWorker::Reply(WorkerReply::Ok(json!(["ok", null, { "syscalls": 1 }]))),
                FromWorker::Reply(WorkerReply::Ok(Value::Null)),
            ]
        );
    }

    #[test]
    fn loop_reports_misuse_without_dying() {
        let input = frames(&[
            ToWorker::Request(ManagerRequest::Deliver(increment())),
            ToWorker::Request(set_bundle("v1")),
            ToWorker::Request(set_bundle("v1")),
        ]);
        let mut output = Vec::new();
        run_worker(input, &mut output).unwrap();
        let replies = replies(output);
        assert_eq!(replies.len(), 3);
        assert!(matches!(
            &replies[0],
            FromWorker::Reply(WorkerReply::Error(msg)) if msg.contains("not ready")
        ));
        assert_eq!(replies[1], FromWorker::Reply(WorkerReply::DispatchReady));
        assert!(matches!(
            &replies[2],
            FromWorker::Reply(WorkerReply::Error(msg)) if msg.contains("already initialized")
        ));
    }
}
