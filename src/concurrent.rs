//! Bounded producer/worker pipeline
//!
//! One shared utility schedules the three concurrent workloads (directory
//! traversal, partitioned object listing, and transfer pools): a producer
//! feeds a bounded channel, a fixed-size pool of workers drains it, and
//! every worker error is collected and surfaced after all siblings finish.
//! There is no cancellation; workers run to completion.

use crate::error::QfsError;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default pool size for traversal, listing, and transfer workloads
pub const DEFAULT_WORKERS: usize = 10;

/// Run `worker` over every item with a fixed-size pool
///
/// Errors do not stop the pool; they are gathered into the returned vector
/// after every worker has drained the channel.
pub async fn run_pool<T, F, Fut>(items: Vec<T>, workers: usize, worker: F) -> Vec<QfsError>
where
	T: Send + 'static,
	F: Fn(T) -> Fut + Clone + Send + Sync + 'static,
	Fut: Future<Output = Result<(), QfsError>> + Send,
{
	let workers = workers.max(1);
	let (tx, rx) = mpsc::channel::<T>(workers * 2);
	let rx = Arc::new(Mutex::new(rx));
	let errors = Arc::new(Mutex::new(Vec::new()));

	let producer = tokio::spawn(async move {
		for item in items {
			if tx.send(item).await.is_err() {
				break;
			}
		}
	});

	let mut handles = Vec::with_capacity(workers);
	for _ in 0..workers {
		let rx = Arc::clone(&rx);
		let errors = Arc::clone(&errors);
		let worker = worker.clone();
		handles.push(tokio::spawn(async move {
			loop {
				let item = {
					let mut guard = rx.lock().await;
					guard.recv().await
				};
				let item = match item {
					Some(i) => i,
					None => break,
				};
				if let Err(e) = worker(item).await {
					errors.lock().await.push(e);
				}
			}
		}));
	}

	let _ = producer.await;
	join_all(handles).await;

	match Arc::try_unwrap(errors) {
		Ok(m) => m.into_inner(),
		Err(arc) => arc.lock().await.drain(..).collect(),
	}
}

/// Fold a vector of worker errors into a single result, logging the rest
pub fn first_error(mut errors: Vec<QfsError>) -> Result<(), QfsError> {
	use crate::logging::error;
	if errors.is_empty() {
		return Ok(());
	}
	for e in errors.iter().skip(1) {
		error!("{}", e);
	}
	Err(errors.remove(0))
}


// vim: ts=4
