use crate::run_worker;
use async_trait::async_trait;
use std::{
    io::{BufReader, BufWriter},
    os::unix::net::UnixStream as StdUnixStream,
    thread,
};
use tokio::net::UnixStream;
use vat_worker_protocol::{ProtocolResult, WorkerChannel, WorkerLauncher};

/// Runs each worker loop on a dedicated thread, connected through a Unix
/// socket pair. Speaks exactly the same frames as a worker subprocess.
#[derive(Debug, Default, Clone, Copy)]
pub struct InProcessLauncher;

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    async fn launch(&self, name: &str) -> ProtocolResult<WorkerChannel> {
        let (runtime_end, worker_end) = StdUnixStream::pair()?;
        let worker_reader = worker_end.try_clone()?;
        let worker_name = name.to_string();
        thread::Builder::new()
            .name(format!("vat-worker-{name}"))
            .spawn(move || {
                let reader = BufReader::new(worker_reader);
                let writer = BufWriter::new(worker_end);
                if let Err(err) = run_worker(reader, writer) {
                    tracing::warn!(worker = %worker_name, %err, "in-process worker stopped");
                }
            })?;

        runtime_end.set_nonblocking(true)?;
        let stream = UnixStream::from_std(runtime_end)?;
        let (read_half, write_half) = stream.into_split();
        Ok(WorkerChannel::new(
            name,
            Box::new(read_half),
            Box::new(write_half),
        ))
    }
}
