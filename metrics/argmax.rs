use ndarray::prelude::*;
use num_traits::Float;

/**
Return the index of the greatest score in `scores`, or `None` if `scores` is empty.

Ties resolve to the first maximum. A `NaN` compares greater than every number, so the first `NaN` in the lane wins.
*/
pub fn argmax<T>(scores: ArrayView1<T>) -> Option<usize>
where
	T: Float,
{
	let mut best: Option<(usize, T)> = None;
	for (index, &score) in scores.iter().enumerate() {
		match best {
			None => best = Some((index, score)),
			Some((_, max)) if max.is_nan() => break,
			Some((_, max)) => {
				if score.is_nan() || score > max {
					best = Some((index, score));
				}
			}
		}
	}
	best.map(|(index, _)| index)
}

#[test]
fn test_argmax() {
	assert_eq!(argmax(arr1(&[0.1f32, 0.9, 0.0]).view()), Some(1));
	assert_eq!(argmax(arr1(&[-3.0f64, -1.0, -2.0]).view()), Some(1));
	assert_eq!(argmax(arr1(&[7.0f32]).view()), Some(0));
}

#[test]
fn test_argmax_ties() {
	assert_eq!(argmax(arr1(&[0.5f32, 0.5, 0.0]).view()), Some(0));
	assert_eq!(argmax(arr1(&[0.0f32, 0.5, 0.5]).view()), Some(1));
	assert_eq!(argmax(arr1(&[1.0f32, 1.0, 1.0, 1.0]).view()), Some(0));
}

#[test]
fn test_argmax_nan() {
	assert_eq!(argmax(arr1(&[0.1f32, f32::NAN, 0.9, f32::NAN]).view()), Some(1));
	assert_eq!(argmax(arr1(&[f32::NAN, 0.9]).view()), Some(0));
	assert_eq!(
		argmax(arr1(&[f32::NEG_INFINITY, f32::INFINITY]).view()),
		Some(1)
	);
}

#[test]
fn test_argmax_empty() {
	let scores: Array1<f32> = Array1::zeros(0);
	assert_eq!(argmax(scores.view()), None);
}
