//! Generates small synthetic 2-D classification datasets
//!
//! Every generator takes the random number generator explicitly so a dataset can be
//! reproduced from a seed. Labels are class indices.

use std::{
    f64::consts::PI,
    fmt::{self, Display},
};

use clap::ValueEnum;
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::scalar::Scalar;

/// Toggles between dataset types
#[derive(Debug, ValueEnum, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Line,
    Circle,
    XOR,
    Moon,
    Spiral,
}

impl Dataset {
    pub fn num_classes(&self) -> usize {
        match self {
            Dataset::Spiral => SPIRAL_ARMS,
            _ => 2,
        }
    }
}

impl Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dataset::Line => write!(f, "line"),
            Dataset::Circle => write!(f, "circle"),
            Dataset::XOR => write!(f, "xor"),
            Dataset::Moon => write!(f, "moon"),
            Dataset::Spiral => write!(f, "spiral"),
        }
    }
}

const SPIRAL_ARMS: usize = 3;

type Points = (Vec<[f64; 2]>, Vec<usize>);

/// Loads `class_size` samples per class of a dataset as an `(N, 2)` matrix and its labels
pub fn load_dataset<T: Scalar, R: Rng + ?Sized>(
    dataset: Dataset,
    class_size: usize,
    rng: &mut R,
) -> (Array2<T>, Vec<usize>) {
    let (points, labels) = match dataset {
        Dataset::Line => gen_linear_data(class_size, rng),
        Dataset::Circle => gen_circle_data(class_size, rng),
        Dataset::XOR => gen_xor_data(class_size, rng),
        Dataset::Moon => gen_moon_data(class_size, rng),
        Dataset::Spiral => gen_spiral_data(class_size, rng),
    };
    let x = Array2::from_shape_fn((points.len(), 2), |(i, j)| T::cast(points[i][j]));
    (x, labels)
}

/// Linearly separable points, class 0 below the diagonal `x = y`
fn gen_linear_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let mut counts = [0; 2];

    while counts.iter().any(|&c| c < class_size) {
        let x = rng.random_range(-5.0..5.0);
        let y = rng.random_range(-5.0..5.0);
        let label = if x > y { 0 } else { 1 };
        if counts[label] < class_size {
            counts[label] += 1;
            data.push([x, y]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Two noisy concentric rings
fn gen_circle_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for (label, radius) in [3.0, 5.0].into_iter().enumerate() {
        for _ in 0..class_size {
            let angle = rng.random_range(0.0..2.0 * PI);
            let r = radius + radius * rng.random_range(-0.25..0.25);
            data.push([r * angle.cos(), r * angle.sin()]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Class 0 in the first and third quadrants, class 1 in the others
fn gen_xor_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();

    for label in 0..2 {
        for _ in 0..class_size {
            let x: f64 = rng.random_range(0.1..5.0);
            let y: f64 = rng.random_range(0.1..5.0);
            let (sx, sy) = match (label, rng.random_bool(0.5)) {
                (0, true) => (1.0, 1.0),
                (0, false) => (-1.0, -1.0),
                (_, true) => (1.0, -1.0),
                (_, false) => (-1.0, 1.0),
            };
            data.push([sx * x, sy * y]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Two interleaving half circles
fn gen_moon_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let radius = 3.0;

    for label in 0..2 {
        for _ in 0..class_size {
            let theta = rng.random_range(-PI / 4.0..PI * 5.0 / 4.0);
            let (x, y) = if label == 0 {
                (radius * theta.cos(), radius * theta.sin())
            } else {
                (radius * theta.cos() + 2.0, -radius * theta.sin() - 0.2)
            };
            let noise_x = rng.random_range(-0.1..0.1);
            let noise_y = rng.random_range(-0.1..0.1);
            data.push([x + noise_x, y + noise_y]);
            labels.push(label);
        }
    }

    (data, labels)
}

/// Interleaved spiral arms, one class per arm
fn gen_spiral_data<R: Rng + ?Sized>(class_size: usize, rng: &mut R) -> Points {
    let mut data = Vec::new();
    let mut labels = Vec::new();
    let steps = class_size.saturating_sub(1).max(1) as f64;

    for label in 0..SPIRAL_ARMS {
        for i in 0..class_size {
            let frac = i as f64 / steps;
            let noise: f64 = StandardNormal.sample(rng);
            let theta = 4.0 * (label as f64 + frac) + 0.2 * noise;
            data.push([frac * theta.sin(), frac * theta.cos()]);
            labels.push(label);
        }
    }

    (data, labels)
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;

    const ALL: [Dataset; 5] = [
        Dataset::Line,
        Dataset::Circle,
        Dataset::XOR,
        Dataset::Moon,
        Dataset::Spiral,
    ];

    #[test]
    fn test_class_balance() {
        let mut rng = Pcg64Mcg::seed_from_u64(0);
        for dataset in ALL {
            let (x, y) = load_dataset::<f64, _>(dataset, 40, &mut rng);
            let k = dataset.num_classes();
            assert_eq!(x.dim(), (40 * k, 2), "{dataset}");
            for class in 0..k {
                assert_eq!(y.iter().filter(|&&c| c == class).count(), 40, "{dataset}");
            }
            assert!(x.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_labels_match_geometry() {
        let mut rng = Pcg64Mcg::seed_from_u64(1);
        let (x, y) = load_dataset::<f64, _>(Dataset::Line, 50, &mut rng);
        for (p, &label) in x.outer_iter().zip(&y) {
            assert_eq!(label, usize::from(p[0] <= p[1]));
        }

        let (x, y) = load_dataset::<f64, _>(Dataset::XOR, 50, &mut rng);
        for (p, &label) in x.outer_iter().zip(&y) {
            assert_eq!(label, usize::from(p[0] * p[1] < 0.0));
        }

        let (x, y) = load_dataset::<f32, _>(Dataset::Circle, 50, &mut rng);
        for (p, &label) in x.outer_iter().zip(&y) {
            let r = p[0].hypot(p[1]);
            if label == 0 {
                assert!(r <= 3.75 + 1e-4);
            } else {
                assert!(r >= 3.75 - 1e-4);
            }
        }
    }

    #[test]
    fn test_seeded() {
        let a = load_dataset::<f64, _>(Dataset::Spiral, 20, &mut Pcg64Mcg::seed_from_u64(9));
        let b = load_dataset::<f64, _>(Dataset::Spiral, 20, &mut Pcg64Mcg::seed_from_u64(9));
        assert_eq!(a, b);
    }
}
