//! Worker client loop (§4.7 "Worker loop", §5): dials the master, then
//! repeatedly takes a testcase, drives the backend, and reports back.

use tokio::net::TcpStream;

use aero_cpu_core::CpuState;
use aero_snapshot::TestcaseResult;

use crate::backend::Backend;
use crate::error::FuzzError;
use crate::protocol::{decode_testcase, encode_worker_message, read_frame, write_frame, WorkerMessage};

/// The target-specific hook package a worker drives around each run (§1:
/// "what a given target's `insert_testcase` does" is external). `restore`
/// undoes whatever host-side bookkeeping `insert_testcase` performed (e.g.
/// guest-file-table state), distinct from `Backend::restore`'s register/RAM
/// rollback.
pub trait Target {
    fn insert_testcase(&mut self, bytes: &[u8]);
    fn restore(&mut self);
}

/// A `Target` that does nothing, for backends/snapshots with no FS-emulation
/// or syscall-trampoline hooks registered.
pub struct NullTarget;

impl Target for NullTarget {
    fn insert_testcase(&mut self, _bytes: &[u8]) {}
    fn restore(&mut self) {}
}

/// Connect to `address` and run testcases against `backend` until the
/// connection closes (the master exhausted `--runs` or the worker itself
/// errors out).
pub async fn run(
    address: &str,
    backend: &mut dyn Backend,
    target: &mut dyn Target,
    cpu_state: &CpuState,
) -> Result<(), FuzzError> {
    let mut stream = TcpStream::connect(address).await?;
    tracing::info!(%address, "worker connected to master");

    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(payload) => payload,
            Err(crate::error::ProtocolError::ConnectionClosed) => {
                tracing::info!("master closed the connection");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        let bytes = decode_testcase(&payload)?;

        target.insert_testcase(&bytes);
        let result = backend.run(&bytes)?;
        let coverage = if matches!(result, TestcaseResult::Timedout) {
            backend.revoke_last_new_coverage();
            Default::default()
        } else {
            backend.last_new_coverage()
        };

        let msg = WorkerMessage { testcase: bytes, coverage, result };
        write_frame(&mut stream, &encode_worker_message(&msg)).await?;

        target.restore();
        backend.restore(cpu_state)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_target_is_a_no_op() {
        let mut target = NullTarget;
        target.insert_testcase(b"anything");
        target.restore();
    }
}
