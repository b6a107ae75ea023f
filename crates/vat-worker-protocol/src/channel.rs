use crate::{
    FromWorker, ManagerRequest, ProtocolError, ProtocolResult, ToWorker, WorkerReply,
    WorkerUpcall,
    frame::{read_frame_async, write_frame_async},
};
use serde_json::{Value, json};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    process::Child,
};

pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Runtime-side handling of upcalls that arrive while a request is in flight.
pub trait UpcallHandler: Send {
    /// Answer a syscall. The returned value is sent back as the syscall result.
    fn syscall(&mut self, request: Value) -> Value;

    fn console(&mut self, level: &str, args: &[Value]) {
        tracing::info!(target: "vat_console", vat_level = level, ?args, "vat console");
    }

    fn test_log(&mut self, args: &[Value]) {
        tracing::debug!(?args, "vat testLog");
    }
}

/// Handler for requests during which a vat may not issue syscalls.
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectSyscalls;

impl UpcallHandler for RejectSyscalls {
    fn syscall(&mut self, request: Value) -> Value {
        tracing::warn!(?request, "syscall outside of a delivery");
        json!(["error", "syscalls are not allowed outside a delivery"])
    }
}

/// Runtime end of a connection to one worker.
pub struct WorkerChannel {
    name: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    child: Option<Child>,
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("name", &self.name)
            .field("subprocess", &self.child.as_ref().and_then(Child::id))
            .finish()
    }
}

impl WorkerChannel {
    pub fn new(name: impl Into<String>, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            name: name.into(),
            reader,
            writer,
            child: None,
        }
    }

    /// Attach the worker process so that [`WorkerChannel::close`] reaps it.
    pub fn with_child(mut self, child: Child) -> Self {
        self.child = Some(child);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send `request` and service upcalls until the worker replies.
    pub async fn call(
        &mut self,
        request: ManagerRequest,
        upcalls: &mut dyn UpcallHandler,
    ) -> ProtocolResult<WorkerReply> {
        self.send(&ToWorker::Request(request)).await?;
        loop {
            let Some(payload) = read_frame_async(&mut self.reader).await? else {
                return Err(ProtocolError::WorkerExited(self.name.clone()));
            };
            match FromWorker::decode(&payload)? {
                FromWorker::Reply(reply) => return Ok(reply),
                FromWorker::Upcall(WorkerUpcall::Syscall(request)) => {
                    let result = upcalls.syscall(request);
                    self.send(&ToWorker::SyscallResult(result)).await?;
                }
                FromWorker::Upcall(WorkerUpcall::Console { level, args }) => {
                    upcalls.console(&level, &args);
                }
                FromWorker::Upcall(WorkerUpcall::TestLog(args)) => upcalls.test_log(&args),
            }
        }
    }

    /// Like [`WorkerChannel::call`] but converts error and bad-tag replies into errors.
    pub async fn call_ok(
        &mut self,
        request: ManagerRequest,
        upcalls: &mut dyn UpcallHandler,
    ) -> ProtocolResult<WorkerReply> {
        match self.call(request, upcalls).await? {
            WorkerReply::Error(message) => Err(ProtocolError::Remote(message)),
            WorkerReply::BadTag(tag) => Err(ProtocolError::BadTag(tag)),
            reply => Ok(reply),
        }
    }

    /// Ask the worker to stop, then reap its process if there is one.
    pub async fn close(mut self) -> ProtocolResult<()> {
        let outcome = self.call(ManagerRequest::Shutdown, &mut RejectSyscalls).await;
        if let Err(err) = &outcome {
            tracing::debug!(worker = %self.name, %err, "shutdown request failed");
        }
        let _ = self.writer.shutdown().await;
        if let Some(mut child) = self.child.take() {
            let status = child.wait().await?;
            tracing::debug!(worker = %self.name, %status, "worker process exited");
        }
        outcome.map(|_| ())
    }

    async fn send(&mut self, message: &ToWorker) -> ProtocolResult<()> {
        let payload = message.encode()?;
        write_frame_async(&mut self.writer, &payload).await
    }
}
