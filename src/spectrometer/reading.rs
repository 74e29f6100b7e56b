//! Simulated spectrometer readings
//!
//! For each element of the grade's profile the generator draws a value inside
//! `[min, max]`, except for `incorrect_count` randomly chosen elements which
//! are pushed just outside it. Every value carries a little noise and is
//! rounded to four decimals.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Local;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use crate::spectrometer::composition::CompositionSource;
use crate::utils::error::NotFound;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const NOISE: f64 = 0.005;
const MAX_DEVIATION: f64 = 0.15;
const MIN_DEVIATION: f64 = 0.01;
const SPIKE_CHANCE: f64 = 0.05;
const SPIKE_FACTOR: f64 = 2.0;
const SPIKE_LIMIT: f64 = 1.0;
/// Elements whose out-of-range values may also spike.
const SPIKE_ELEMENTS: [&str; 4] = ["S", "P", "Pb", "Mn"];

/// One reading: element values plus a local timestamp, serialized as a flat
/// JSON object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    #[serde(flatten)]
    pub elements: BTreeMap<String, f64>,
    pub timestamp: String,
}

impl Reading {
    pub fn get(&self, element: &str) -> Option<f64> {
        self.elements.get(element).copied()
    }
}

#[derive(Clone)]
pub struct ReadingGenerator {
    source: Arc<dyn CompositionSource>,
}

impl ReadingGenerator {
    pub fn new(source: Arc<dyn CompositionSource>) -> Self {
        Self { source }
    }

    pub fn generate(&self, grade: &str, incorrect_count: usize) -> Result<Reading, NotFound> {
        self.generate_with(&mut rand::thread_rng(), grade, incorrect_count)
    }

    /// `incorrect_count` is clamped to the number of elements in the profile.
    pub fn generate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        grade: &str,
        incorrect_count: usize,
    ) -> Result<Reading, NotFound> {
        let profile = self.source.composition_range(grade)?;

        let symbols: Vec<&String> = profile.keys().collect();
        let incorrect: HashSet<&String> = symbols
            .choose_multiple(rng, incorrect_count.min(symbols.len()))
            .copied()
            .collect();

        let mut elements = BTreeMap::new();
        for (element, &(min, max)) in &profile {
            let (min, max) = if min <= max { (min, max) } else { (max, min) };
            let value = if incorrect.contains(element) {
                let value = out_of_range(rng, min, max);
                if SPIKE_ELEMENTS.contains(&element.as_str()) {
                    spike(rng, value)
                } else {
                    value
                }
            } else {
                within_range(rng, min, max)
            };
            elements.insert(element.clone(), round4(value));
        }

        Ok(Reading {
            elements,
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
        })
    }
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn noisy<R: Rng + ?Sized>(rng: &mut R, value: f64) -> f64 {
    round4(value + rng.gen_range(-NOISE..=NOISE))
}

fn within_range<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    let value = rng.gen_range(min..=max);
    noisy(rng, value)
}

fn out_of_range<R: Rng + ?Sized>(rng: &mut R, min: f64, max: f64) -> f64 {
    let value = if rng.gen_bool(0.5) {
        rng.gen_range(min - MAX_DEVIATION..=min - MIN_DEVIATION)
    } else {
        rng.gen_range(max + MIN_DEVIATION..=max + MAX_DEVIATION)
    };
    noisy(rng, value)
}

fn spike<R: Rng + ?Sized>(rng: &mut R, value: f64) -> f64 {
    if rng.gen_bool(SPIKE_CHANCE) {
        round4(value * SPIKE_FACTOR).min(SPIKE_LIMIT)
    } else {
        value
    }
}
