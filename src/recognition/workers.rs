//! Background prediction workers
//!
//! Jobs go through a shared channel to a fixed set of threads; each
//! submission gets its own reply channel carrying exactly one result.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info};

use super::error::{PredictionError, PredictionResult};
use super::service::{Prediction, PredictionService};
use super::validation::ImageInput;

struct Job {
    input: ImageInput,
    reply: Sender<PredictionResult<Prediction>>,
}

/// Thread pool running predictions off the caller's thread
pub struct PredictionWorkers {
    jobs: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl PredictionWorkers {
    /// Start `threads` workers sharing one service
    pub fn spawn(service: Arc<PredictionService>, threads: usize) -> Self {
        let threads = threads.max(1);
        let (jobs, queue) = unbounded::<Job>();

        let handles = (0..threads)
            .map(|id| {
                let queue = queue.clone();
                let service = service.clone();
                std::thread::spawn(move || worker_loop(id, queue, service))
            })
            .collect();

        info!("Started {} prediction worker(s)", threads);

        Self {
            jobs: Some(jobs),
            handles,
        }
    }

    /// Queue an image; the result arrives on the returned receiver
    pub fn submit(&self, input: ImageInput) -> Receiver<PredictionResult<Prediction>> {
        let (reply, result) = bounded(1);

        let Some(jobs) = &self.jobs else {
            let _ = reply.send(Err(closed()));
            return result;
        };

        if let Err(rejected) = jobs.send(Job { input, reply }) {
            let _ = rejected.0.reply.send(Err(closed()));
        }

        result
    }

    /// Stop accepting work and wait for queued jobs to finish
    pub fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for PredictionWorkers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, queue: Receiver<Job>, service: Arc<PredictionService>) {
    debug!("Prediction worker {} starting", id);
    for job in queue {
        let result = service.predict(&job.input);
        // Caller may have stopped waiting
        let _ = job.reply.send(result);
    }
    debug!("Prediction worker {} exiting", id);
}

fn closed() -> PredictionError {
    PredictionError::Inference("prediction workers are shut down".to_string())
}
