use super::MixupAccuracyState;
use std::sync::{Barrier, Mutex};
use thiserror::Error;

/**
The `AllReduce` trait is the seam to a distributed-reduction collaborator. Every worker passes in its local state and receives the element-wise sum of the states of all workers.

Implementations must count each worker exactly once per call. The transport behind it, whether threads, processes, or hosts, is up to the implementation.
*/
pub trait AllReduce {
	type Error: std::fmt::Display;
	fn all_reduce_sum(
		&self,
		local: MixupAccuracyState,
	) -> Result<MixupAccuracyState, Self::Error>;
}

/**
An [AllReduce](trait.AllReduce.html) across a fixed number of threads in one process. Every thread must call `all_reduce_sum()` once per round.

A failure in one worker fails the round for every worker. Each worker still passes every barrier of the round, so none of them is left waiting.
*/
pub struct ThreadAllReduce {
	barrier: Barrier,
	round: Mutex<Round>,
}

#[derive(Default)]
struct Round {
	sum: MixupAccuracyState,
	overflowed: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum ThreadAllReduceError {
	#[error("a worker panicked while holding the reduction lock")]
	Poisoned,
	#[error("the summed counts overflow u64")]
	Overflow,
}

impl ThreadAllReduce {
	pub fn new(n_workers: usize) -> Self {
		Self {
			barrier: Barrier::new(n_workers),
			round: Mutex::new(Round::default()),
		}
	}
}

impl AllReduce for ThreadAllReduce {
	type Error = ThreadAllReduceError;

	fn all_reduce_sum(
		&self,
		local: MixupAccuracyState,
	) -> Result<MixupAccuracyState, ThreadAllReduceError> {
		// Errors are held until after the last barrier.
		let added = match self.round.lock() {
			Ok(mut round) => match round.sum.checked_merge(local) {
				Some(sum) => {
					round.sum = sum;
					Ok(())
				}
				None => {
					round.overflowed = true;
					Err(ThreadAllReduceError::Overflow)
				}
			},
			Err(_) => Err(ThreadAllReduceError::Poisoned),
		};
		self.barrier.wait();
		let global = added.and_then(|_| match self.round.lock() {
			Ok(round) if round.overflowed => Err(ThreadAllReduceError::Overflow),
			Ok(round) => Ok(round.sum),
			Err(_) => Err(ThreadAllReduceError::Poisoned),
		});
		// Every worker has read the sum before the leader clears it for the next round.
		if self.barrier.wait().is_leader() {
			if let Ok(mut round) = self.round.lock() {
				*round = Round::default();
			}
		}
		self.barrier.wait();
		global
	}
}

#[cfg(test)]
use super::{MixupAccuracy, StreamingMetric};
#[cfg(test)]
use ndarray::{prelude::*, s};

#[test]
fn test_thread_all_reduce() {
	let n_workers = 4;
	let reducer = ThreadAllReduce::new(n_workers);
	let outputs: Array2<f32> = arr2(&[[0.1, 0.9, 0.0], [0.8, 0.1, 0.1], [0.2, 0.3, 0.5]]);
	let targets_a: Array1<usize> = arr1(&[1, 1, 2]);
	let targets_b: Array1<usize> = arr1(&[0, 0, 0]);
	let lams: Array1<f32> = arr1(&[1.0, 0.0, 0.5]);
	let results: Vec<(MixupAccuracyState, MixupAccuracyState)> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..n_workers)
			.map(|worker| {
				let reducer = &reducer;
				let (outputs, targets_a, targets_b, lams) =
					(&outputs, &targets_a, &targets_b, &lams);
				scope.spawn(move || {
					let mut metric = MixupAccuracy::new();
					// Worker `i` sees the first `i` examples.
					metric
						.update(
							outputs.slice(s![..worker, ..]),
							targets_a.slice(s![..worker]),
							targets_b.slice(s![..worker]),
							lams.slice(s![..worker]),
						)
						.unwrap();
					let first = metric.sync(reducer).unwrap().state();
					metric
						.update(
							outputs.view(),
							targets_a.view(),
							targets_b.view(),
							lams.view(),
						)
						.unwrap();
					let second = metric.sync(reducer).unwrap().state();
					(first, second)
				})
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});
	// Workers saw 0, 1, 2 and 3 examples. Batch credits are 0, 1, 2 and 2.5 -> 2.
	let first = MixupAccuracyState {
		correct: 5,
		total: 6,
	};
	// Each worker then adds the full batch, credit 2.5 -> 2.
	let second = MixupAccuracyState {
		correct: 13,
		total: 18,
	};
	for (left, right) in results {
		assert_eq!(left, first);
		assert_eq!(right, second);
	}
}

#[test]
fn test_thread_all_reduce_single_worker() {
	let reducer = ThreadAllReduce::new(1);
	let local = MixupAccuracyState {
		correct: 3,
		total: 4,
	};
	assert_eq!(reducer.all_reduce_sum(local).unwrap(), local);
	assert_eq!(reducer.all_reduce_sum(local).unwrap(), local);
	let mut metric = MixupAccuracy::from(local);
	metric.merge(MixupAccuracy::from(local));
	assert_eq!(metric.sync(&reducer).unwrap().compute(), Ok(0.75));
}

#[test]
fn test_thread_all_reduce_overflow() {
	let reducer = ThreadAllReduce::new(2);
	let locals = [
		MixupAccuracyState {
			correct: u64::MAX,
			total: u64::MAX,
		},
		MixupAccuracyState {
			correct: 1,
			total: 1,
		},
	];
	let results: Vec<_> = std::thread::scope(|scope| {
		let handles: Vec<_> = locals
			.iter()
			.map(|&local| {
				let reducer = &reducer;
				scope.spawn(move || reducer.all_reduce_sum(local))
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});
	for result in results {
		assert_eq!(result, Err(ThreadAllReduceError::Overflow));
	}
	// The failed round is cleared, so the next one succeeds.
	let local = MixupAccuracyState {
		correct: 1,
		total: 2,
	};
	let results: Vec<_> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..2)
			.map(|_| {
				let reducer = &reducer;
				scope.spawn(move || reducer.all_reduce_sum(local))
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});
	for result in results {
		assert_eq!(
			result,
			Ok(MixupAccuracyState {
				correct: 2,
				total: 4,
			})
		);
	}
}

#[test]
fn test_thread_all_reduce_poisoned() {
	let reducer = ThreadAllReduce::new(3);
	// A thread that panics while holding the lock poisons it.
	let panicked = std::thread::scope(|scope| {
		scope
			.spawn(|| {
				let _round = reducer.round.lock().unwrap();
				panic!("worker failed");
			})
			.join()
			.is_err()
	});
	assert!(panicked);
	let metric = MixupAccuracy::from(MixupAccuracyState {
		correct: 1,
		total: 1,
	});
	let results: Vec<_> = std::thread::scope(|scope| {
		let handles: Vec<_> = (0..3)
			.map(|_| {
				let (reducer, metric) = (&reducer, &metric);
				scope.spawn(move || metric.sync(reducer))
			})
			.collect();
		handles.into_iter().map(|h| h.join().unwrap()).collect()
	});
	for result in results {
		assert_eq!(
			result,
			Err(crate::Error::Reduce(ThreadAllReduceError::Poisoned.to_string()))
		);
	}
}
