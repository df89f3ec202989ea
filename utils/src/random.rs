//! Random selection over a borrowed slice.
//!
//! Callers own the slice and the RNG; nothing here mutates either beyond
//! advancing the RNG.

use rand::Rng;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("need at least two elements to pick a distinct pair, got {0}")]
    NotEnoughElements(usize),
}

/// Returns a random element of `elems`, or `None` when it is empty.
pub fn random_element<'a, T, R: Rng + ?Sized>(elems: &'a [T], rng: &mut R) -> Option<&'a T> {
    if elems.is_empty() {
        return None;
    }
    elems.get(rng.random_range(0..elems.len()))
}

/// Picks two random elements that compare unequal.
///
/// The second pick is resampled until it differs from the first, at most
/// `elems.len()` times. If every resample collides (only possible when the
/// slice holds duplicates or the RNG is degenerate) the first element that
/// differs is used instead, so the result is always a distinct pair as long
/// as one exists.
pub fn random_distinct_pair<'a, T, R>(
    elems: &'a [T],
    rng: &mut R,
) -> Result<(&'a T, &'a T), SelectionError>
where
    T: PartialEq,
    R: Rng + ?Sized,
{
    let not_enough = SelectionError::NotEnoughElements(elems.len());
    if elems.len() < 2 {
        return Err(not_enough);
    }
    let first = random_element(elems, rng).ok_or(not_enough)?;
    for _ in 0..elems.len() {
        match random_element(elems, rng) {
            Some(second) if second != first => return Ok((first, second)),
            _ => continue,
        }
    }
    elems
        .iter()
        .find(|candidate| *candidate != first)
        .map(|second| (first, second))
        .ok_or(SelectionError::NotEnoughElements(1))
}
