//! Variant expander: lazy, deterministic Cartesian expansion of instruction
//! descriptors into concrete test cases.
//!
//! Order is derived only from declaration order: descriptors in list order,
//! then encodings (fragment axes, last axis fastest), then state assignments
//! (state axes, last axis fastest). A failing case can therefore be
//! regenerated from the descriptor list and its position alone.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::grammar::InstructionDescriptor;
use crate::state::{Location, StateAssignment, StateValue};

/// One concrete combination of instruction bytes and initial state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestCase {
    /// Index of the generating descriptor in its list
    pub descriptor: usize,
    /// Flattened instruction bytes
    pub insn: Vec<u8>,
    /// Value of every varied location
    pub state: StateAssignment,
}

/// Lazy odometer over a list of axes.
///
/// Yields one combination per step with the last axis varying fastest. No
/// axes yields exactly one empty combination; any empty axis yields nothing.
#[derive(Debug, Clone)]
pub struct CartesianProduct<T> {
    axes: Vec<Vec<T>>,
    indices: Vec<usize>,
    done: bool,
}

impl<T: Clone> CartesianProduct<T> {
    pub fn new(axes: Vec<Vec<T>>) -> Self {
        let done = axes.iter().any(|axis| axis.is_empty());
        let indices = vec![0; axes.len()];
        Self { axes, indices, done }
    }

    fn advance(&mut self) {
        for k in (0..self.axes.len()).rev() {
            self.indices[k] += 1;
            if self.indices[k] < self.axes[k].len() {
                return;
            }
            self.indices[k] = 0;
        }
        self.done = true;
    }
}

impl<T: Clone> Iterator for CartesianProduct<T> {
    type Item = Vec<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self
            .axes
            .iter()
            .zip(&self.indices)
            .map(|(axis, &i)| axis[i].clone())
            .collect();
        self.advance();
        Some(item)
    }
}

/// All test cases of one descriptor.
#[derive(Debug, Clone)]
pub struct Variants {
    descriptor: usize,
    encodings: CartesianProduct<Vec<u8>>,
    state_template: CartesianProduct<(Location, StateValue)>,
    states: CartesianProduct<(Location, StateValue)>,
    current: Option<Vec<u8>>,
}

impl Iterator for Variants {
    type Item = TestCase;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(insn) = &self.current {
                if let Some(state) = self.states.next() {
                    return Some(TestCase {
                        descriptor: self.descriptor,
                        insn: insn.clone(),
                        state,
                    });
                }
            }
            let parts = self.encodings.next()?;
            self.current = Some(parts.concat());
            self.states = self.state_template.clone();
        }
    }
}

/// Expand one descriptor.
pub fn variants(index: usize, desc: &InstructionDescriptor) -> Variants {
    let encodings = CartesianProduct::new(desc.fragments.iter().map(|f| f.emit()).collect());
    let state_axes = desc
        .state
        .iter()
        .map(|s| {
            s.domain
                .values()
                .into_iter()
                .map(|v| (s.location.clone(), v))
                .collect()
        })
        .collect();
    let state_template = CartesianProduct::new(state_axes);

    Variants {
        descriptor: index,
        encodings,
        states: state_template.clone(),
        state_template,
        current: None,
    }
}

/// Expand a descriptor list into one lazy, restartable sequence.
pub fn expand(
    descs: &[InstructionDescriptor],
) -> impl Iterator<Item = TestCase> + Clone + '_ {
    descs
        .iter()
        .enumerate()
        .flat_map(|(index, desc)| variants(index, desc))
}

/// Exact number of test cases of one descriptor, without expanding it.
pub fn variant_count(desc: &InstructionDescriptor) -> u128 {
    let encodings: u128 = desc.fragments.iter().map(|f| f.axis_len() as u128).product();
    let states: u128 = desc.state.iter().map(|s| s.domain.len() as u128).product();
    encodings * states
}

/// Exact number of test cases of a descriptor list.
pub fn total_count(descs: &[InstructionDescriptor]) -> u128 {
    descs.iter().map(variant_count).sum()
}

/// Bernoulli sampling: keeps each case independently with a fixed
/// probability. Only the expected sample size is known up front.
#[derive(Debug, Clone)]
pub struct Sampler<I, R> {
    inner: I,
    probability: f64,
    rng: R,
}

impl<I, R> Sampler<I, R> {
    /// `percent` must be in `1..=100`.
    pub fn new(inner: I, percent: u8, rng: R) -> Self {
        let probability = f64::from(percent.clamp(1, 100)) / 100.0;
        Self {
            inner,
            probability,
            rng,
        }
    }
}

impl<I: Iterator, R: Rng> Iterator for Sampler<I, R> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.inner.next()?;
            if self.rng.gen_bool(self.probability) {
                return Some(item);
            }
        }
    }
}
