/*
 * Copyright (c) 2020-2022, Stalwart Labs Ltd.
 *
 * This file is part of the Stalwart Mesh Server.
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of
 * the License, or (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 * in the LICENSE file at the top-level directory of this distribution.
 * You should have received a copy of the GNU Affero General Public License
 * along with this program.  If not, see <http://www.gnu.org/licenses/>.
 *
 * You can be released from the requirements of the AGPLv3 license by
 * purchasing a commercial license. Please contact licensing@stalw.art
 * for more details.
*/

/*
   Vivaldi network coordinates, estimated from the round-trip times the
   failure detector measures anyway. Ported from the algorithm in
   "Vivaldi: A Decentralized Network Coordinate System" (Dabek et al.).
*/

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

const ZERO_THRESHOLD: f64 = 1.0e-6;

#[derive(Debug, Clone)]
pub struct CoordinateConfig {
    pub dimensionality: usize,
    pub vivaldi_error_max: f64,
    pub vivaldi_ce: f64,
    pub vivaldi_cc: f64,
    pub adjustment_window_size: usize,
    pub height_min: f64,
}

impl Default for CoordinateConfig {
    fn default() -> Self {
        CoordinateConfig {
            dimensionality: 8,
            vivaldi_error_max: 1.5,
            vivaldi_ce: 0.25,
            vivaldi_cc: 0.25,
            adjustment_window_size: 20,
            height_min: 10.0e-6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Coordinate {
    pub vec: Vec<f64>,
    pub error: f64,
    pub adjustment: f64,
    pub height: f64,
}

impl Coordinate {
    pub fn new(config: &CoordinateConfig) -> Self {
        Coordinate {
            vec: vec![0.0; config.dimensionality],
            error: config.vivaldi_error_max,
            adjustment: 0.0,
            height: config.height_min,
        }
    }

    pub fn is_compatible_with(&self, other: &Coordinate) -> bool {
        self.vec.len() == other.vec.len()
    }

    /// Estimated round-trip time to `other`.
    pub fn distance_to(&self, other: &Coordinate) -> Duration {
        let dist = self.raw_distance_to(other);
        let adjusted = (dist + self.adjustment + other.adjustment).max(dist);
        Duration::from_secs_f64(adjusted)
    }

    fn raw_distance_to(&self, other: &Coordinate) -> f64 {
        magnitude(&difference(&self.vec, &other.vec)) + self.height + other.height
    }

    fn apply_force(&self, config: &CoordinateConfig, force: f64, other: &Coordinate) -> Coordinate {
        let mut moved = self.clone();
        let (unit, mag) = unit_vector(&difference(&self.vec, &other.vec));
        for (value, unit) in moved.vec.iter_mut().zip(unit.iter()) {
            *value += unit * force;
        }
        if mag > ZERO_THRESHOLD {
            moved.height = (((self.height + other.height) * force / mag) + self.height)
                .max(config.height_min);
        }
        moved
    }
}

/// Maintains this node's coordinate, folding in one observation per
/// completed probe.
pub struct CoordinateClient {
    config: CoordinateConfig,
    inner: Mutex<ClientState>,
}

struct ClientState {
    coord: Coordinate,
    adjustment_samples: Vec<f64>,
    adjustment_index: usize,
}

impl CoordinateClient {
    pub fn new(config: CoordinateConfig) -> Self {
        let coord = Coordinate::new(&config);
        let samples = vec![0.0; config.adjustment_window_size];
        CoordinateClient {
            config,
            inner: Mutex::new(ClientState {
                coord,
                adjustment_samples: samples,
                adjustment_index: 0,
            }),
        }
    }

    pub fn get(&self) -> Coordinate {
        self.inner.lock().coord.clone()
    }

    /// Folds one RTT observation against `other` into our coordinate and
    /// returns the updated value.
    pub fn update(&self, other: &Coordinate, rtt: Duration) -> Coordinate {
        let mut state = self.inner.lock();
        if !state.coord.is_compatible_with(other) {
            return state.coord.clone();
        }
        let rtt_sec = rtt.as_secs_f64().max(ZERO_THRESHOLD);
        let dist = state.coord.raw_distance_to(other);
        let wrongness = ((dist - rtt_sec) / rtt_sec).abs();

        let total_error = (state.coord.error + other.error).max(ZERO_THRESHOLD);
        let weight = state.coord.error / total_error;

        state.coord.error = (wrongness * self.config.vivaldi_ce * weight
            + state.coord.error * (1.0 - self.config.vivaldi_ce * weight))
            .min(self.config.vivaldi_error_max);

        let force = (rtt_sec - dist) * self.config.vivaldi_cc * weight;
        state.coord = state.coord.apply_force(&self.config, force, other);

        // Rolling adjustment term: half the average residual error.
        let idx = state.adjustment_index;
        state.adjustment_samples[idx] = rtt_sec - state.coord.raw_distance_to(other);
        state.adjustment_index = (idx + 1) % state.adjustment_samples.len();
        let sum: f64 = state.adjustment_samples.iter().sum();
        state.coord.adjustment = sum / (2.0 * state.adjustment_samples.len() as f64);

        state.coord.clone()
    }
}

fn difference(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b.iter()).map(|(a, b)| a - b).collect()
}

fn magnitude(vec: &[f64]) -> f64 {
    vec.iter().map(|v| v * v).sum::<f64>().sqrt()
}

/// Unit vector along `vec`, or a random direction when the magnitude is
/// (near) zero so two co-located nodes can still push apart.
fn unit_vector(vec: &[f64]) -> (Vec<f64>, f64) {
    let mag = magnitude(vec);
    if mag > ZERO_THRESHOLD {
        return (vec.iter().map(|v| v / mag).collect(), mag);
    }
    let mut rng = rand::thread_rng();
    let random: Vec<f64> = (0..vec.len()).map(|_| rng.gen::<f64>() - 0.5).collect();
    let mag = magnitude(&random);
    if mag > ZERO_THRESHOLD {
        (random.iter().map(|v| v / mag).collect(), 0.0)
    } else {
        let mut fallback = vec![0.0; vec.len()];
        if let Some(first) = fallback.first_mut() {
            *first = 1.0;
        }
        (fallback, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let config = CoordinateConfig::default();
        let mut a = Coordinate::new(&config);
        let mut b = Coordinate::new(&config);
        a.vec[0] = 1.0;
        b.vec[0] = 4.0;
        b.vec[1] = 4.0;
        assert_eq!(a.distance_to(&b), b.distance_to(&a));
    }

    #[test]
    fn updates_converge_toward_the_observed_rtt() {
        let config = CoordinateConfig::default();
        let client = CoordinateClient::new(config.clone());
        let other = Coordinate::new(&config);
        let rtt = Duration::from_millis(100);

        for _ in 0..64 {
            client.update(&other, rtt);
        }
        let estimate = client.get().distance_to(&other);
        let error_ms = (estimate.as_secs_f64() - rtt.as_secs_f64()).abs() * 1000.0;
        assert!(error_ms < 25.0, "estimate off by {:.1} ms", error_ms);
    }

    #[test]
    fn incompatible_dimensions_are_rejected() {
        let config = CoordinateConfig::default();
        let client = CoordinateClient::new(config.clone());
        let other = Coordinate {
            vec: vec![0.0; 2],
            error: 1.0,
            adjustment: 0.0,
            height: config.height_min,
        };
        let before = client.get();
        let after = client.update(&other, Duration::from_millis(10));
        assert_eq!(before.vec, after.vec);
    }
}
