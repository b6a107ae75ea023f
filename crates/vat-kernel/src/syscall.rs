//! Kernel-side syscall handling for live deliveries.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use serde_json::{Value, json};

use crate::vat::VatId;

/// Answers syscalls a vat makes during a live delivery.
///
/// Never consulted during replay: replayed syscalls are answered from the
/// transcript.
pub trait SyscallHandler: Send + Sync {
    fn handle(&self, vat_id: &VatId, request: &Value) -> Value;
}

/// A message a vat sent with the `send` syscall.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub from: VatId,
    pub target: Value,
    pub msg: Value,
}

#[derive(Debug, Default)]
struct State {
    vatstore: BTreeMap<(VatId, String), String>,
    sent: Vec<SentMessage>,
    exited: BTreeSet<VatId>,
}

/// Minimal syscall handler: a per-vat string store plus recording of
/// outbound messages and exit requests.
#[derive(Debug, Default)]
pub struct VatstoreSyscalls {
    state: Mutex<State>,
}

impl VatstoreSyscalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vatstore_get(&self, vat_id: &VatId, key: &str) -> Option<String> {
        self.lock()
            .vatstore
            .get(&(vat_id.clone(), key.to_string()))
            .cloned()
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.lock().sent.clone()
    }

    pub fn exited(&self, vat_id: &VatId) -> bool {
        self.lock().exited.contains(vat_id)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn text_arg(request: &Value, idx: usize) -> Option<String> {
    request.get(idx).and_then(Value::as_str).map(str::to_string)
}

impl SyscallHandler for VatstoreSyscalls {
    fn handle(&self, vat_id: &VatId, request: &Value) -> Value {
        let tag = request.get(0).and_then(Value::as_str).unwrap_or_default();
        let mut state = self.lock();
        match tag {
            "vatstoreGet" => match text_arg(request, 1) {
                Some(key) => {
                    let value = state.vatstore.get(&(vat_id.clone(), key)).cloned();
                    json!(["ok", value])
                }
                None => json!(["error", "vatstoreGet requires a key"]),
            },
            "vatstoreSet" => match (text_arg(request, 1), text_arg(request, 2)) {
                (Some(key), Some(value)) => {
                    state.vatstore.insert((vat_id.clone(), key), value);
                    json!(["ok", null])
                }
                _ => json!(["error", "vatstoreSet requires a key and a value"]),
            },
            "vatstoreDelete" => match text_arg(request, 1) {
                Some(key) => {
                    state.vatstore.remove(&(vat_id.clone(), key));
                    json!(["ok", null])
                }
                None => json!(["error", "vatstoreDelete requires a key"]),
            },
            "send" => {
                state.sent.push(SentMessage {
                    from: vat_id.clone(),
                    target: request.get(1).cloned().unwrap_or(Value::Null),
                    msg: request.get(2).cloned().unwrap_or(Value::Null),
                });
                json!(["ok", null])
            }
            "subscribe" | "resolve" | "dropImports" | "retireImports" | "retireExports" => {
                json!(["ok", null])
            }
            "exit" => {
                log::info!("vat {vat_id} requested exit");
                state.exited.insert(vat_id.clone());
                json!(["ok", null])
            }
            other => {
                log::warn!("vat {vat_id} made unknown syscall {other:?}");
                json!(["error", format!("unknown syscall {other:?}")])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vatstore_is_scoped_per_vat() {
        let syscalls = VatstoreSyscalls::new();
        let a = VatId::new("v1");
        let b = VatId::new("v2");
        assert_eq!(
            syscalls.handle(&a, &json!(["vatstoreSet", "count", "3"])),
            json!(["ok", null])
        );
        assert_eq!(
            syscalls.handle(&a, &json!(["vatstoreGet", "count"])),
            json!(["ok", "3"])
        );
        assert_eq!(
            syscalls.handle(&b, &json!(["vatstoreGet", "count"])),
            json!(["ok", null])
        );
        syscalls.handle(&a, &json!(["vatstoreDelete", "count"]));
        assert_eq!(syscalls.vatstore_get(&a, "count"), None);
    }

    #[test]
    fn records_sends_and_exits() {
        let syscalls = VatstoreSyscalls::new();
        let vat = VatId::new("v3");
        syscalls.handle(&vat, &json!(["send", "o-5", {"methargs": {}}]));
        syscalls.handle(&vat, &json!(["exit", false, "done"]));
        let sent = syscalls.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, json!("o-5"));
        assert!(syscalls.exited(&vat));
    }

    #[test]
    fn unknown_syscalls_are_errors() {
        let syscalls = VatstoreSyscalls::new();
        let reply = syscalls.handle(&VatId::new("v1"), &json!(["callNow", "d-1"]));
        assert_eq!(reply[0], json!("error"));
    }
}
