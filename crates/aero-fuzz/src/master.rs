//! Master scheduler (§4.7, §4.7.1, §5): listens for workers, aggregates
//! coverage and corpus, and dispatches mutated testcases until `--runs`
//! (if nonzero) is exhausted.
//!
//! Grounded on the workspace's own `tokio` feature selection (`net`,
//! `io-util`, `rt-multi-thread`, `sync`) — the retrieved example pack has no
//! `src/` content left for a length-prefixed TCP master/worker service to
//! imitate directly (see `DESIGN.md`), so the per-connection task / shared
//! `tokio::sync::Mutex` state shape here follows §4.7.1 and §5 directly.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::error::FuzzError;
use crate::mutate::Mutator;
use crate::protocol::{decode_worker_message, encode_testcase, read_frame, write_frame};
use aero_snapshot::TestcaseResult;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub address: String,
    /// Total testcases to dispatch across the whole fleet; `0` = unbounded.
    pub runs: u64,
    pub max_len: usize,
    pub name: String,
    pub target: PathBuf,
    pub inputs: PathBuf,
    pub outputs: PathBuf,
    pub crashes: PathBuf,
    pub seed: u64,
}

struct SharedState {
    coverage: HashSet<u64>,
    corpus: Vec<Vec<u8>>,
    runs_remaining: Option<u64>,
    next_seed_index: usize,
}

impl SharedState {
    /// `None` means unbounded; `Some(0)` means the budget is spent.
    fn take_run_slot(&mut self) -> bool {
        match &mut self.runs_remaining {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        }
    }

    fn select_seed(&mut self) -> Vec<u8> {
        if self.corpus.is_empty() {
            return Vec::new();
        }
        let seed = self.corpus[self.next_seed_index % self.corpus.len()].clone();
        self.next_seed_index = self.next_seed_index.wrapping_add(1);
        seed
    }
}

/// Load the seed corpus from `inputs/`, bind the listening socket, and run
/// the accept loop until `--runs` is exhausted and every worker has
/// disconnected.
pub async fn run(config: MasterConfig, mutator: Arc<dyn Mutator>) -> Result<(), FuzzError> {
    std::fs::create_dir_all(&config.outputs)?;
    std::fs::create_dir_all(&config.crashes)?;

    let mut corpus = Vec::new();
    if config.inputs.is_dir() {
        let mut paths: Vec<_> = std::fs::read_dir(&config.inputs)?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            corpus.push(std::fs::read(&path)?);
        }
    }

    let state = Arc::new(Mutex::new(SharedState {
        coverage: HashSet::new(),
        corpus,
        runs_remaining: if config.runs == 0 { None } else { Some(config.runs) },
        next_seed_index: 0,
    }));

    let listener = TcpListener::bind(&config.address).await?;
    tracing::info!(name = %config.name, address = %config.address, "master listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::info!(%peer, "worker connected");
        let state = Arc::clone(&state);
        let mutator = Arc::clone(&mutator);
        let config = config.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_worker(stream, state, mutator, config).await {
                tracing::warn!(%peer, error = %err, "worker disconnected");
            }
        });
    }
}

#[tracing::instrument(skip(stream, state, mutator, config))]
async fn handle_worker(
    mut stream: TcpStream,
    state: Arc<Mutex<SharedState>>,
    mutator: Arc<dyn Mutator>,
    config: MasterConfig,
) -> Result<(), FuzzError> {
    loop {
        let mutated = {
            let mut guard = state.lock().await;
            if !guard.take_run_slot() {
                return Ok(());
            }
            let seed = guard.select_seed();
            mutator.mutate(&seed, config.max_len)
        };

        write_frame(&mut stream, &encode_testcase(&mutated)).await?;

        let payload = read_frame(&mut stream).await?;
        let msg = decode_worker_message(&payload)?;

        record_result(&state, &config, &msg.testcase, &msg.coverage, &msg.result).await?;
    }
}

async fn record_result(
    state: &Arc<Mutex<SharedState>>,
    config: &MasterConfig,
    testcase: &[u8],
    coverage: &HashSet<u64>,
    result: &TestcaseResult,
) -> Result<(), FuzzError> {
    if matches!(result, TestcaseResult::Timedout) {
        return Ok(());
    }

    let new_coverage = {
        let mut guard = state.lock().await;
        let had_new = coverage.iter().any(|id| !guard.coverage.contains(id));
        if had_new {
            guard.coverage.extend(coverage.iter().copied());
            guard.corpus.push(testcase.to_vec());
        }
        had_new
    };

    if new_coverage {
        let name = blake3::hash(testcase).to_hex().to_string();
        let path = config.outputs.join(name);
        if !path.exists() {
            std::fs::write(path, testcase)?;
        }
    }

    if let TestcaseResult::Crash { name } = result {
        let path = config.crashes.join(name);
        if !path.exists() {
            std::fs::write(path, testcase)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_slot_accounting_stops_at_zero_but_never_for_unbounded() {
        let mut state = SharedState {
            coverage: HashSet::new(),
            corpus: Vec::new(),
            runs_remaining: Some(1),
            next_seed_index: 0,
        };
        assert!(state.take_run_slot());
        assert!(!state.take_run_slot());

        let mut unbounded = SharedState {
            coverage: HashSet::new(),
            corpus: Vec::new(),
            runs_remaining: None,
            next_seed_index: 0,
        };
        for _ in 0..100 {
            assert!(unbounded.take_run_slot());
        }
    }

    #[test]
    fn seed_selection_cycles_through_the_corpus() {
        let mut state = SharedState {
            coverage: HashSet::new(),
            corpus: vec![b"a".to_vec(), b"b".to_vec()],
            runs_remaining: None,
            next_seed_index: 0,
        };
        assert_eq!(state.select_seed(), b"a".to_vec());
        assert_eq!(state.select_seed(), b"b".to_vec());
        assert_eq!(state.select_seed(), b"a".to_vec());
    }

    #[test]
    fn empty_corpus_yields_empty_seed() {
        let mut state = SharedState {
            coverage: HashSet::new(),
            corpus: Vec::new(),
            runs_remaining: None,
            next_seed_index: 0,
        };
        assert!(state.select_seed().is_empty());
    }
}
