// Copyright (c) 2022. Sebastien Soudan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http:www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use num_traits::Float;
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::Error;

/// A random generator: reproducible when `seed` is given, seeded from the OS otherwise.
pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Arithmetic mean.
pub fn mean<F: Float>(x: &[F]) -> Result<F, Error> {
    if x.is_empty() {
        return Err(Error::InsufficientSamples);
    }

    let sum = x.iter().fold(F::zero(), |acc, &v| acc + v);
    Ok(sum / F::from(x.len()).unwrap())
}

/// Population standard deviation (normalized by `n`).
pub fn std_dev<F: Float>(x: &[F]) -> Result<F, Error> {
    Ok(central_moment(x, 2)?.sqrt())
}

/// Sample skewness `m3 / m2^(3/2)` - 0 for a symmetric distribution.
///
/// Returns 0 for a constant sample.
pub fn skewness<F: Float>(x: &[F]) -> Result<F, Error> {
    let m2 = central_moment(x, 2)?;
    if m2 == F::zero() {
        return Ok(F::zero());
    }
    let m3 = central_moment(x, 3)?;
    Ok(m3 / m2.powf(F::from(1.5).unwrap()))
}

/// Excess kurtosis `m4 / m2^2 - 3` - 0 for a normal distribution.
///
/// Returns 0 for a constant sample.
pub fn excess_kurtosis<F: Float>(x: &[F]) -> Result<F, Error> {
    let m2 = central_moment(x, 2)?;
    if m2 == F::zero() {
        return Ok(F::zero());
    }
    let m4 = central_moment(x, 4)?;
    Ok(m4 / (m2 * m2) - F::from(3.).unwrap())
}

fn central_moment<F: Float>(x: &[F], k: i32) -> Result<F, Error> {
    let m = mean(x)?;
    let sum = x.iter().fold(F::zero(), |acc, &v| acc + (v - m).powi(k));
    Ok(sum / F::from(x.len()).unwrap())
}
