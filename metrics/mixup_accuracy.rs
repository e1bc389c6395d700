use super::{argmax::argmax, reduce::AllReduce, Error, Result, StreamingMetric};
use itertools::izip;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};
use std::iter::Sum;
use tracing::{debug, trace, warn};

/// The running counters behind a [MixupAccuracy](struct.MixupAccuracy.html). This is what workers exchange when they reduce their metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixupAccuracyState {
	/// The sum of the credit earned by each batch, truncated toward zero batch by batch.
	pub correct: u64,
	/// The number of examples seen.
	pub total: u64,
}

impl MixupAccuracyState {
	/// Add `other`'s counters to these.
	pub fn merge(&mut self, other: MixupAccuracyState) {
		self.correct += other.correct;
		self.total += other.total;
	}

	/// Add `other`'s counters to these, or return `None` if either sum overflows.
	pub fn checked_merge(self, other: MixupAccuracyState) -> Option<MixupAccuracyState> {
		Some(MixupAccuracyState {
			correct: self.correct.checked_add(other.correct)?,
			total: self.total.checked_add(other.total)?,
		})
	}
}

/**
The mixup accuracy is the accuracy of a classifier trained on mixup batches. Each example is a blend of two source examples, so it has two labels, `target_a` and `target_b`, and a weight `lam` toward `target_a`. A prediction earns `lam` credit for matching `target_a` and `1 - lam` credit for matching `target_b`. If both labels are the same, a matching prediction earns the full credit of 1.

The credit of a batch is truncated toward zero before it is added to the running count of correct examples.
*/
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MixupAccuracy(MixupAccuracyState);

/// A validated batch for [MixupAccuracy](struct.MixupAccuracy.html).
#[derive(Debug)]
pub struct MixupAccuracyInput<'a> {
	/// (n_examples, n_classes)
	outputs: ArrayView2<'a, f32>,
	/// (n_examples), 0-indexed
	targets_a: ArrayView1<'a, usize>,
	/// (n_examples), 0-indexed
	targets_b: ArrayView1<'a, usize>,
	/// (n_examples)
	lams: ArrayView1<'a, f32>,
}

impl<'a> MixupAccuracyInput<'a> {
	/**
	Check that the inputs describe a batch. `targets_a`, `targets_b` and `lams` must have one entry per row of `outputs`.

	Batches are also rejected when a non-empty `outputs` has no columns, or when a lam is not a number in [0, 1]. A plain tensor implementation would accept such lams silently and could then produce negative credit or credit above 1 per example.
	*/
	pub fn new(
		outputs: ArrayView2<'a, f32>,
		targets_a: ArrayView1<'a, usize>,
		targets_b: ArrayView1<'a, usize>,
		lams: ArrayView1<'a, f32>,
	) -> Result<Self> {
		if targets_a.len() != outputs.nrows() {
			return Err(Error::InvalidInput(format!(
				"outputs has {} examples but targets_a has {}",
				outputs.nrows(),
				targets_a.len()
			)));
		}
		if targets_a.len() != targets_b.len() || targets_a.len() != lams.len() {
			return Err(Error::InvalidInput(format!(
				"targets_a, targets_b and lams have lengths {}, {} and {}",
				targets_a.len(),
				targets_b.len(),
				lams.len()
			)));
		}
		if outputs.nrows() > 0 && outputs.ncols() == 0 {
			return Err(Error::InvalidInput(
				"outputs has no classes to predict".to_owned(),
			));
		}
		if let Some((index, lam)) = lams
			.iter()
			.enumerate()
			.find(|(_, lam)| !(0.0..=1.0).contains(*lam))
		{
			return Err(Error::InvalidInput(format!(
				"lam {} at index {} is not in [0, 1]",
				lam, index
			)));
		}
		Ok(Self {
			outputs,
			targets_a,
			targets_b,
			lams,
		})
	}

	pub fn n_examples(&self) -> usize {
		self.targets_a.len()
	}

	/// The sum of the credit earned by every example in the batch.
	fn credit(&self) -> f64 {
		izip!(
			self.outputs.genrows(),
			self.targets_a.iter(),
			self.targets_b.iter(),
			self.lams.iter()
		)
		.map(|(scores, &target_a, &target_b, &lam)| {
			let prediction = argmax(scores);
			let lam = f64::from(lam);
			let mut credit = 0.0;
			if prediction == Some(target_a) {
				credit += lam;
			}
			if prediction == Some(target_b) {
				credit += 1.0 - lam;
			}
			credit
		})
		.sum()
	}
}

impl MixupAccuracy {
	pub fn new() -> Self {
		Self::default()
	}

	/// Validate a batch and add it to the running counts. On error the counts are left unchanged.
	pub fn update<'a>(
		&mut self,
		outputs: ArrayView2<'a, f32>,
		targets_a: ArrayView1<'a, usize>,
		targets_b: ArrayView1<'a, usize>,
		lams: ArrayView1<'a, f32>,
	) -> Result<()> {
		let input = MixupAccuracyInput::new(outputs, targets_a, targets_b, lams)
			.map_err(|error| {
				warn!(%error, "rejected batch");
				error
			})?;
		StreamingMetric::update(self, input);
		Ok(())
	}

	/// Add a batch to the running counts and return the accuracy of that batch alone. An empty batch is accepted but has no accuracy of its own, so it returns [Error::NotReady](enum.Error.html#variant.NotReady).
	pub fn update_and_score<'a>(
		&mut self,
		outputs: ArrayView2<'a, f32>,
		targets_a: ArrayView1<'a, usize>,
		targets_b: ArrayView1<'a, usize>,
		lams: ArrayView1<'a, f32>,
	) -> Result<f32> {
		let mut batch = MixupAccuracy::new();
		batch.update(outputs, targets_a, targets_b, lams)?;
		let score = batch.compute();
		self.merge(batch);
		score
	}

	/// The accuracy so far, `correct / total`. Returns [Error::NotReady](enum.Error.html#variant.NotReady) if no examples have been seen.
	pub fn compute(&self) -> Result<f32> {
		let MixupAccuracyState { correct, total } = self.0;
		if total == 0 {
			return Err(Error::NotReady);
		}
		Ok((correct as f64 / total as f64) as f32)
	}

	pub fn reset(&mut self) {
		debug!(correct = self.0.correct, total = self.0.total, "reset");
		self.0 = MixupAccuracyState::default();
	}

	/// Sum this worker's counts with every other worker's through `reducer`. The local counts are not modified.
	pub fn sync<R>(&self, reducer: &R) -> Result<MixupAccuracy>
	where
		R: AllReduce,
	{
		let global = reducer
			.all_reduce_sum(self.0)
			.map_err(|error| Error::Reduce(error.to_string()))?;
		debug!(
			local_total = self.0.total,
			global_total = global.total,
			"synced"
		);
		Ok(MixupAccuracy(global))
	}

	pub fn correct(&self) -> u64 {
		self.0.correct
	}

	pub fn total(&self) -> u64 {
		self.0.total
	}

	pub fn state(&self) -> MixupAccuracyState {
		self.0
	}
}

impl From<MixupAccuracyState> for MixupAccuracy {
	fn from(state: MixupAccuracyState) -> Self {
		Self(state)
	}
}

impl<'a> StreamingMetric<'a> for MixupAccuracy {
	type Input = MixupAccuracyInput<'a>;
	type Output = Option<f32>;

	fn update(&mut self, input: Self::Input) {
		let n_examples = input.n_examples();
		let credit = input.credit();
		// Truncate toward zero once per batch.
		let correct = credit as u64;
		self.0.correct += correct;
		self.0.total += n_examples as u64;
		trace!(n_examples, credit, correct, "update");
	}

	fn merge(&mut self, other: Self) {
		debug!(
			correct = other.0.correct,
			total = other.0.total,
			"merge"
		);
		self.0.merge(other.0)
	}

	fn finalize(self) -> Self::Output {
		self.compute().ok()
	}
}

impl Sum for MixupAccuracy {
	fn sum<I>(iter: I) -> Self
	where
		I: Iterator<Item = Self>,
	{
		iter.fold(MixupAccuracy::new(), |mut sum, metric| {
			sum.merge(metric);
			sum
		})
	}
}

#[cfg(test)]
use rand::{rngs::StdRng, Rng, SeedableRng};

#[cfg(test)]
struct Batch {
	outputs: Array2<f32>,
	targets_a: Array1<usize>,
	targets_b: Array1<usize>,
	lams: Array1<f32>,
}

#[cfg(test)]
impl Batch {
	fn random(rng: &mut StdRng, same_targets: bool) -> Batch {
		let n_examples = rng.gen_range(0, 16);
		let n_classes = rng.gen_range(1, 6);
		let outputs = Array2::from_shape_fn((n_examples, n_classes), |_| rng.gen::<f32>());
		let targets_a = Array1::from_shape_fn(n_examples, |_| rng.gen_range(0, n_classes));
		let targets_b = if same_targets {
			targets_a.clone()
		} else {
			Array1::from_shape_fn(n_examples, |_| rng.gen_range(0, n_classes))
		};
		let lams = Array1::from_shape_fn(n_examples, |_| rng.gen::<f32>());
		Batch {
			outputs,
			targets_a,
			targets_b,
			lams,
		}
	}

	fn update(&self, metric: &mut MixupAccuracy) -> Result<()> {
		metric.update(
			self.outputs.view(),
			self.targets_a.view(),
			self.targets_b.view(),
			self.lams.view(),
		)
	}
}

#[test]
fn test_two_examples() {
	let mut metric = MixupAccuracy::new();
	let outputs = arr2(&[[0.1, 0.9, 0.0], [0.8, 0.1, 0.1]]);
	let targets_a = arr1(&[1, 1]);
	let targets_b = arr1(&[0, 0]);
	let lams = arr1(&[1.0, 0.0]);
	metric
		.update(
			outputs.view(),
			targets_a.view(),
			targets_b.view(),
			lams.view(),
		)
		.unwrap();
	insta::assert_debug_snapshot!(metric.state(), @r###"
 MixupAccuracyState {
     correct: 2,
     total: 2,
 }
 "###);
	assert_eq!(metric.compute(), Ok(1.0));
	assert_eq!(metric.compute(), metric.compute());
	assert_eq!(metric.finalize(), Some(1.0));
}

#[test]
fn test_fractional_credit_is_truncated_per_batch() {
	let outputs = arr2(&[[0.9, 0.1]]);
	let targets_a = arr1(&[0]);
	let targets_b = arr1(&[1]);
	let lams = arr1(&[0.5]);
	let mut metric = MixupAccuracy::new();
	for _ in 0..2 {
		metric
			.update(
				outputs.view(),
				targets_a.view(),
				targets_b.view(),
				lams.view(),
			)
			.unwrap();
	}
	// Two batches of 0.5 credit each truncate to zero.
	assert_eq!(metric.correct(), 0);
	assert_eq!(metric.total(), 2);
	assert_eq!(metric.compute(), Ok(0.0));
	// The same examples in one batch earn 1.0 credit.
	let outputs = arr2(&[[0.9, 0.1], [0.9, 0.1]]);
	let targets_a = arr1(&[0, 0]);
	let targets_b = arr1(&[1, 1]);
	let lams = arr1(&[0.5, 0.5]);
	let mut metric = MixupAccuracy::new();
	metric
		.update(
			outputs.view(),
			targets_a.view(),
			targets_b.view(),
			lams.view(),
		)
		.unwrap();
	assert_eq!(metric.correct(), 1);
	assert_eq!(metric.compute(), Ok(0.5));
}

#[test]
fn test_same_targets_earn_full_credit() {
	let outputs = arr2(&[
		[0.7, 0.2, 0.1], // correct
		[0.1, 0.2, 0.7], // correct
		[0.1, 0.7, 0.2], // incorrect
		[0.3, 0.3, 0.3], // correct, the first maximum wins
	]);
	let targets = arr1(&[0, 2, 0, 0]);
	let lams = arr1(&[0.3, 0.9, 0.5, 0.0]);
	let mut metric = MixupAccuracy::new();
	metric
		.update(outputs.view(), targets.view(), targets.view(), lams.view())
		.unwrap();
	assert_eq!(metric.correct(), 3);
	assert_eq!(metric.total(), 4);
	assert_eq!(metric.compute(), Ok(0.75));
}

#[test]
fn test_mismatched_lengths() {
	let mut metric = MixupAccuracy::new();
	let outputs = arr2(&[[0.1, 0.9, 0.0], [0.8, 0.1, 0.1]]);
	let targets_a = arr1(&[1, 1]);
	let targets_b = arr1(&[0, 0]);
	let lams = arr1(&[1.0, 0.0, 0.5]);
	let result = metric.update(
		outputs.view(),
		targets_a.view(),
		targets_b.view(),
		lams.view(),
	);
	assert!(matches!(result, Err(Error::InvalidInput(_))));
	let targets_b = arr1(&[0]);
	let lams = arr1(&[1.0, 0.0]);
	let result = metric.update(
		outputs.view(),
		targets_a.view(),
		targets_b.view(),
		lams.view(),
	);
	assert!(matches!(result, Err(Error::InvalidInput(_))));
	let targets_a = arr1(&[1, 1, 1]);
	let targets_b = arr1(&[0, 0, 0]);
	let lams = arr1(&[1.0, 0.0, 0.5]);
	let result = metric.update(
		outputs.view(),
		targets_a.view(),
		targets_b.view(),
		lams.view(),
	);
	assert!(matches!(result, Err(Error::InvalidInput(_))));
	assert_eq!(metric, MixupAccuracy::new());
}

#[test]
fn test_invalid_lams() {
	let mut metric = MixupAccuracy::new();
	let outputs = arr2(&[[0.1, 0.9], [0.8, 0.1]]);
	let targets_a = arr1(&[1, 1]);
	let targets_b = arr1(&[0, 0]);
	for &lam in &[-0.1f32, 1.5, f32::NAN, f32::INFINITY] {
		let lams = arr1(&[0.5, lam]);
		let result = metric.update(
			outputs.view(),
			targets_a.view(),
			targets_b.view(),
			lams.view(),
		);
		assert!(matches!(result, Err(Error::InvalidInput(_))));
	}
	assert_eq!(metric.total(), 0);
}

#[test]
fn test_no_classes() {
	let mut metric = MixupAccuracy::new();
	let outputs: Array2<f32> = Array2::zeros((2, 0));
	let targets = arr1(&[0, 0]);
	let lams = arr1(&[0.5, 0.5]);
	let result = metric.update(outputs.view(), targets.view(), targets.view(), lams.view());
	assert!(matches!(result, Err(Error::InvalidInput(_))));
}

#[test]
fn test_empty_batch() {
	let mut metric = MixupAccuracy::new();
	let outputs: Array2<f32> = Array2::zeros((0, 3));
	let targets: Array1<usize> = Array1::zeros(0);
	let lams: Array1<f32> = Array1::zeros(0);
	metric
		.update(outputs.view(), targets.view(), targets.view(), lams.view())
		.unwrap();
	assert_eq!(metric.total(), 0);
	assert_eq!(metric.compute(), Err(Error::NotReady));
	assert_eq!(
		metric.update_and_score(outputs.view(), targets.view(), targets.view(), lams.view()),
		Err(Error::NotReady)
	);
}

#[test]
fn test_not_ready() {
	let metric = MixupAccuracy::new();
	assert_eq!(metric.compute(), Err(Error::NotReady));
	assert_eq!(metric.compute(), Err(Error::NotReady));
	assert_eq!(metric.finalize(), None);
}

#[test]
fn test_update_and_score() {
	let mut metric = MixupAccuracy::new();
	let outputs = arr2(&[[0.1, 0.9, 0.0], [0.8, 0.1, 0.1]]);
	let targets_a = arr1(&[1, 1]);
	let targets_b = arr1(&[0, 0]);
	let lams = arr1(&[1.0, 0.0]);
	let score = metric.update_and_score(
		outputs.view(),
		targets_a.view(),
		targets_b.view(),
		lams.view(),
	);
	assert_eq!(score, Ok(1.0));
	let targets_a = arr1(&[2, 2]);
	let targets_b = arr1(&[2, 2]);
	let score = metric.update_and_score(
		outputs.view(),
		targets_a.view(),
		targets_b.view(),
		lams.view(),
	);
	assert_eq!(score, Ok(0.0));
	assert_eq!(metric.compute(), Ok(0.5));
}

#[test]
fn test_reset() {
	let mut metric = MixupAccuracy::from(MixupAccuracyState {
		correct: 3,
		total: 5,
	});
	metric.reset();
	assert_eq!(metric, MixupAccuracy::new());
	assert_eq!(metric.compute(), Err(Error::NotReady));
}

#[test]
fn test_merge() {
	let mut rng = StdRng::seed_from_u64(42);
	let batches: Vec<Batch> = (0..12).map(|_| Batch::random(&mut rng, false)).collect();
	let mut single = MixupAccuracy::new();
	for batch in batches.iter() {
		batch.update(&mut single).unwrap();
	}
	// Split the batches across three workers.
	let workers: Vec<MixupAccuracy> = batches
		.chunks(4)
		.map(|chunk| {
			let mut metric = MixupAccuracy::new();
			for batch in chunk {
				batch.update(&mut metric).unwrap();
			}
			metric
		})
		.collect();
	let (a, b, c) = (
		workers[0].clone(),
		workers[1].clone(),
		workers[2].clone(),
	);
	let mut left = a.clone();
	left.merge(b.clone());
	left.merge(c.clone());
	let mut right = c;
	right.merge(a);
	right.merge(b);
	assert_eq!(left, right);
	assert_eq!(left, single);
	let summed: MixupAccuracy = workers.into_iter().sum();
	assert_eq!(summed, single);
	assert_eq!(summed.compute(), single.compute());
}

#[test]
fn test_random_batches() {
	let mut rng = StdRng::seed_from_u64(0);
	let mut metric = MixupAccuracy::new();
	for _ in 0..500 {
		let batch = Batch::random(&mut rng, false);
		let before = metric.state();
		batch.update(&mut metric).unwrap();
		let after = metric.state();
		let n_examples = batch.targets_a.len() as u64;
		assert_eq!(after.total - before.total, n_examples);
		assert!(after.correct >= before.correct);
		assert!(after.correct - before.correct <= n_examples);
		assert!(after.correct <= after.total);
	}
}

#[test]
fn test_random_batches_with_same_targets() {
	let mut rng = StdRng::seed_from_u64(1);
	let mut metric = MixupAccuracy::new();
	for _ in 0..500 {
		let batch = Batch::random(&mut rng, true);
		let n_correct = batch
			.outputs
			.genrows()
			.into_iter()
			.zip(batch.targets_a.iter())
			.filter(|(scores, target)| argmax(scores.view()) == Some(**target))
			.count() as u64;
		let before = metric.correct();
		batch.update(&mut metric).unwrap();
		assert_eq!(metric.correct() - before, n_correct);
	}
}

#[test]
fn test_sync() {
	struct Peers(Vec<MixupAccuracyState>);
	impl AllReduce for Peers {
		type Error = std::convert::Infallible;
		fn all_reduce_sum(
			&self,
			local: MixupAccuracyState,
		) -> std::result::Result<MixupAccuracyState, Self::Error> {
			let mut sum = local;
			for peer in self.0.iter() {
				sum.merge(*peer);
			}
			Ok(sum)
		}
	}
	let metric = MixupAccuracy::from(MixupAccuracyState {
		correct: 1,
		total: 2,
	});
	let peers = Peers(vec![
		MixupAccuracyState {
			correct: 4,
			total: 4,
		},
		MixupAccuracyState {
			correct: 0,
			total: 2,
		},
	]);
	let global = metric.sync(&peers).unwrap();
	assert_eq!(global.correct(), 5);
	assert_eq!(global.total(), 8);
	assert_eq!(global.compute(), Ok(0.625));
	assert_eq!(metric.total(), 2);
}

#[test]
fn test_sync_failure() {
	struct Unreachable;
	impl AllReduce for Unreachable {
		type Error = String;
		fn all_reduce_sum(
			&self,
			_: MixupAccuracyState,
		) -> std::result::Result<MixupAccuracyState, String> {
			Err("peer 1 is unreachable".to_owned())
		}
	}
	let metric = MixupAccuracy::new();
	assert_eq!(
		metric.sync(&Unreachable),
		Err(Error::Reduce("peer 1 is unreachable".to_owned()))
	);
}

#[test]
fn test_checked_merge() {
	let state = MixupAccuracyState {
		correct: 1,
		total: 2,
	};
	assert_eq!(
		state.checked_merge(state),
		Some(MixupAccuracyState {
			correct: 2,
			total: 4,
		})
	);
	let full = MixupAccuracyState {
		correct: 0,
		total: u64::MAX,
	};
	assert_eq!(full.checked_merge(state), None);
}

#[test]
fn test_state_serialization() {
	let state = MixupAccuracyState {
		correct: 2,
		total: 3,
	};
	let json = serde_json::to_string(&state).unwrap();
	assert_eq!(json, r#"{"correct":2,"total":3}"#);
	let state: MixupAccuracyState = serde_json::from_str(&json).unwrap();
	let accuracy = MixupAccuracy::from(state).compute().unwrap();
	assert!(f32::abs(accuracy - 2.0 / 3.0) < f32::EPSILON);
}
