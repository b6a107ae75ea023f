use crate::{
    ProtocolError, ProtocolResult,
    frame::{decode_payload, encode_payload},
};
use serde_json::{Value, json};
use std::path::PathBuf;

/// Commands the runtime issues to a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerRequest {
    /// Install the vat program. Allowed once per worker.
    SetBundle {
        vat_id: String,
        bundle: Value,
        vat_parameters: Value,
        virtual_object_cache_size: Option<u64>,
    },
    /// Install the vat program from a raw heap snapshot instead of a bundle.
    LoadSnapshot { vat_id: String, path: PathBuf },
    Deliver(Value),
    /// Write a raw heap snapshot to `path`.
    Snapshot { path: PathBuf },
    Shutdown,
}

/// Everything the runtime may put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ToWorker {
    Request(ManagerRequest),
    /// Answer to the worker's outstanding syscall upcall.
    SyscallResult(Value),
}

/// Final answer to a [`ManagerRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReply {
    DispatchReady,
    Ok(Value),
    Error(String),
    BadTag(String),
}

/// Messages a worker sends while a request is in flight.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerUpcall {
    /// Expects a [`ToWorker::SyscallResult`] before the worker continues.
    Syscall(Value),
    Console { level: String, args: Vec<Value> },
    TestLog(Vec<Value>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum FromWorker {
    Reply(WorkerReply),
    Upcall(WorkerUpcall),
}

fn arg(tag: &str, rest: &mut Vec<Value>, idx: usize) -> ProtocolResult<Value> {
    rest.get_mut(idx)
        .map(Value::take)
        .ok_or_else(|| ProtocolError::Malformed(format!("{tag}: missing argument {idx}")))
}

fn str_arg(tag: &str, rest: &mut Vec<Value>, idx: usize) -> ProtocolResult<String> {
    match arg(tag, rest, idx)? {
        Value::String(s) => Ok(s),
        other => Err(ProtocolError::Malformed(format!(
            "{tag}: argument {idx} must be text, got {other}"
        ))),
    }
}

fn path_arg(tag: &str, rest: &mut Vec<Value>, idx: usize) -> ProtocolResult<PathBuf> {
    str_arg(tag, rest, idx).map(PathBuf::from)
}

impl ToWorker {
    pub fn to_items(&self) -> Vec<Value> {
        match self {
            ToWorker::Request(ManagerRequest::SetBundle {
                vat_id,
                bundle,
                vat_parameters,
                virtual_object_cache_size,
            }) => vec![
                json!("setBundle"),
                json!(vat_id),
                bundle.clone(),
                vat_parameters.clone(),
                json!(virtual_object_cache_size),
            ],
            ToWorker::Request(ManagerRequest::LoadSnapshot { vat_id, path }) => vec![
                json!("loadSnapshot"),
                json!(vat_id),
                json!(path.to_string_lossy()),
            ],
            ToWorker::Request(ManagerRequest::Deliver(delivery)) => {
                vec![json!("deliver"), delivery.clone()]
            }
            ToWorker::Request(ManagerRequest::Snapshot { path }) => {
                vec![json!("snapshot"), json!(path.to_string_lossy())]
            }
            ToWorker::Request(ManagerRequest::Shutdown) => vec![json!("shutdown")],
            ToWorker::SyscallResult(result) => vec![json!("syscallResult"), result.clone()],
        }
    }

    pub fn from_items(tag: &str, mut rest: Vec<Value>) -> ProtocolResult<Self> {
        let message = match tag {
            "setBundle" => ToWorker::Request(ManagerRequest::SetBundle {
                vat_id: str_arg(tag, &mut rest, 0)?,
                bundle: arg(tag, &mut rest, 1)?,
                vat_parameters: rest.get_mut(2).map(Value::take).unwrap_or(Value::Null),
                virtual_object_cache_size: rest.get(3).and_then(Value::as_u64),
            }),
            "loadSnapshot" => ToWorker::Request(ManagerRequest::LoadSnapshot {
                vat_id: str_arg(tag, &mut rest, 0)?,
                path: path_arg(tag, &mut rest, 1)?,
            }),
            "deliver" => ToWorker::Request(ManagerRequest::Deliver(arg(tag, &mut rest, 0)?)),
            "snapshot" => ToWorker::Request(ManagerRequest::Snapshot {
                path: path_arg(tag, &mut rest, 0)?,
            }),
            "shutdown" => ToWorker::Request(ManagerRequest::Shutdown),
            "syscallResult" => ToWorker::SyscallResult(arg(tag, &mut rest, 0)?),
            other => return Err(ProtocolError::BadTag(other.to_string())),
        };
        Ok(message)
    }

    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_payload(&self.to_items())
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (tag, rest) = decode_payload(bytes)?;
        Self::from_items(&tag, rest)
    }
}

impl From<ManagerRequest> for ToWorker {
    fn from(request: ManagerRequest) -> Self {
        ToWorker::Request(request)
    }
}

impl FromWorker {
    pub fn to_items(&self) -> Vec<Value> {
        match self {
            FromWorker::Reply(WorkerReply::DispatchReady) => vec![json!("dispatchReady")],
            FromWorker::Reply(WorkerReply::Ok(value)) => vec![json!("ok"), value.clone()],
            FromWorker::Reply(WorkerReply::Error(message)) => {
                vec![json!("error"), json!(message)]
            }
            FromWorker::Reply(WorkerReply::BadTag(tag)) => vec![json!("bad tag"), json!(tag)],
            FromWorker::Upcall(WorkerUpcall::Syscall(request)) => {
                vec![json!("syscall"), request.clone()]
            }
            FromWorker::Upcall(WorkerUpcall::Console { level, args }) => {
                let mut items = vec![json!("console"), json!(level)];
                items.extend(args.iter().cloned());
                items
            }
            FromWorker::Upcall(WorkerUpcall::TestLog(args)) => {
                let mut items = vec![json!("testLog")];
                items.extend(args.iter().cloned());
                items
            }
        }
    }

    pub fn from_items(tag: &str, mut rest: Vec<Value>) -> ProtocolResult<Self> {
        let message = match tag {
            "dispatchReady" => FromWorker::Reply(WorkerReply::DispatchReady),
            "ok" => FromWorker::Reply(WorkerReply::Ok(
                rest.get_mut(0).map(Value::take).unwrap_or(Value::Null),
            )),
            "error" => FromWorker::Reply(WorkerReply::Error(str_arg(tag, &mut rest, 0)?)),
            "bad tag" => FromWorker::Reply(WorkerReply::BadTag(str_arg(tag, &mut rest, 0)?)),
            "syscall" => FromWorker::Upcall(WorkerUpcall::Syscall(arg(tag, &mut rest, 0)?)),
            "console" => {
                let level = str_arg(tag, &mut rest, 0)?;
                rest.remove(0);
                FromWorker::Upcall(WorkerUpcall::Console { level, args: rest })
            }
            "testLog" => FromWorker::Upcall(WorkerUpcall::TestLog(rest)),
            other => return Err(ProtocolError::BadTag(other.to_string())),
        };
        Ok(message)
    }

    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        encode_payload(&self.to_items())
    }

    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let (tag, rest) = decode_payload(bytes)?;
        Self::from_items(&tag, rest)
    }
}

impl From<WorkerReply> for FromWorker {
    fn from(reply: WorkerReply) -> Self {
        FromWorker::Reply(reply)
    }
}

impl From<WorkerUpcall> for FromWorker {
    fn from(upcall: WorkerUpcall) -> Self {
        FromWorker::Upcall(upcall)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bundle_wire_form() {
        let msg = ToWorker::Request(ManagerRequest::SetBundle {
            vat_id: "v3".into(),
            bundle: json!({"moduleFormat": "builtin", "name": "counter"}),
            vat_parameters: json!({"start": 5}),
            virtual_object_cache_size: Some(10),
        });
        let items = msg.to_items();
        assert_eq!(items[0], json!("setBundle"));
        assert_eq!(items[1], json!("v3"));
        assert_eq!(items[4], json!(10));
        assert_eq!(ToWorker::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn unknown_tags_surface_as_bad_tag() {
        let bytes = encode_payload(&[json!("frobnicate"), json!(1)]).unwrap();
        assert!(matches!(
            ToWorker::decode(&bytes),
            Err(ProtocolError::BadTag(tag)) if tag == "frobnicate"
        ));
        assert!(matches!(
            FromWorker::decode(&bytes),
            Err(ProtocolError::BadTag(_))
        ));
    }

    #[test]
    fn missing_arguments_are_malformed() {
        let bytes = encode_payload(&[json!("deliver")]).unwrap();
        assert!(matches!(
            ToWorker::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
        let bytes = encode_payload(&[json!("loadSnapshot"), json!("v1"), json!(3)]).unwrap();
        assert!(matches!(
            ToWorker::decode(&bytes),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn console_upcall_keeps_variadic_args() {
        let msg = FromWorker::Upcall(WorkerUpcall::Console {
            level: "info".into(),
            args: vec![json!("count is"), json!(3)],
        });
        assert_eq!(
            msg.to_items(),
            vec![json!("console"), json!("info"), json!("count is"), json!(3)]
        );
        assert_eq!(FromWorker::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn bad_tag_reply_matches_legacy_shape() {
        let reply = FromWorker::Reply(WorkerReply::BadTag("nope".into()));
        assert_eq!(reply.to_items(), vec![json!("bad tag"), json!("nope")]);
    }
}
