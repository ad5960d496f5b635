//! CPU-side field representation and the reference diffusion stepper.
//!
//! The GPU compute shader in `diffuse.wgsl` and [`Field::stepped`] implement
//! the same update rule: for every cell, accumulate `(neighbor - v)` over the
//! 4-connected neighbors that lie inside the grid and apply
//! `next = v + rate * sum`. Off-grid neighbors contribute nothing, so the
//! domain boundary passes no flux and the field total is conserved.

pub mod gpucompute;

use bytemuck::{Pod, Zeroable};
use rayon::prelude::*;

/// Dense 2D scalar field, row-major. Dimensions are fixed for the lifetime
/// of the field.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    width: u32,
    height: u32,
    values: Vec<f32>,
}

impl Field {
    /// An all-zero field. Dimensions must be positive.
    pub fn new(width: u32, height: u32) -> Field {
        assert!(width > 0 && height > 0, "field dimensions must be positive");
        Field {
            width,
            height,
            values: vec![0.0; width as usize * height as usize],
        }
    }

    /// Rebuild a field from raw row-major values, e.g. after GPU readback.
    pub fn from_values(width: u32, height: u32, values: Vec<f32>) -> Field {
        assert_eq!(values.len(), width as usize * height as usize);
        Field {
            width,
            height,
            values,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    fn index(&self, x: u32, y: u32) -> usize {
        debug_assert!(x < self.width && y < self.height);
        y as usize * self.width as usize + x as usize
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[self.index(x, y)]
    }

    pub fn set(&mut self, x: u32, y: u32, value: f32) {
        let idx = self.index(x, y);
        self.values[idx] = value;
    }

    /// Write `value` into every cell whose center lies within `radius` of
    /// `(cx, cy)`. The standard initial condition is a hot disk in the
    /// middle of an otherwise cold grid.
    pub fn seed_disk(&mut self, cx: f32, cy: f32, radius: f32, value: f32) {
        let r2 = radius * radius;
        for y in 0..self.height {
            for x in 0..self.width {
                let dx = x as f32 + 0.5 - cx;
                let dy = y as f32 + 0.5 - cy;
                if dx * dx + dy * dy <= r2 {
                    let idx = self.index(x, y);
                    self.values[idx] = value;
                }
            }
        }
    }

    /// Sum of all cell values. Invariant under stepping: the no-flux
    /// boundary means the update only redistributes differences internally.
    pub fn total(&self) -> f64 {
        self.values.iter().map(|&v| v as f64).sum()
    }

    /// One explicit diffusion step, reading `self` and producing a fresh
    /// field. Rows are independent within a step, so they run in parallel.
    pub fn stepped(&self, rate: f32) -> Field {
        let width = self.width as usize;
        let height = self.height as usize;
        let src = &self.values;
        let mut next = vec![0.0f32; src.len()];

        next.par_chunks_mut(width).enumerate().for_each(|(y, row)| {
            for (x, out) in row.iter_mut().enumerate() {
                let idx = y * width + x;
                let v = src[idx];
                let mut acc = 0.0;
                if x > 0 {
                    acc += src[idx - 1] - v;
                }
                if x + 1 < width {
                    acc += src[idx + 1] - v;
                }
                if y > 0 {
                    acc += src[idx - width] - v;
                }
                if y + 1 < height {
                    acc += src[idx + width] - v;
                }
                *out = v + rate * acc;
            }
        });

        Field {
            width: self.width,
            height: self.height,
            values: next,
        }
    }
}

/// Parameters of the explicit diffusion update, uploaded as a uniform.
/// Constant across a run.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct DiffusionParams {
    /// Step size of the explicit update, in (0, 1). The 4-neighbor stencil
    /// is unconditionally stable only for rates up to 0.25.
    pub rate: f32,
}

impl DiffusionParams {
    /// Conservative stability bound for the 4-neighbor stencil.
    pub const STABLE_RATE: f32 = 0.25;

    pub fn new(rate: f32) -> DiffusionParams {
        assert!(
            rate > 0.0 && rate < 1.0,
            "diffusion rate must lie in (0, 1), got {rate}"
        );
        if rate > Self::STABLE_RATE {
            log::warn!(
                "diffusion rate {rate} exceeds the stability bound {}; the field may diverge",
                Self::STABLE_RATE
            );
        }
        DiffusionParams { rate }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOLERANCE: f32 = 1e-5;

    fn point_seed(width: u32, height: u32, x: u32, y: u32) -> Field {
        let mut field = Field::new(width, height);
        field.set(x, y, 1.0);
        field
    }

    #[test]
    fn first_step_from_interior_point_seed_is_exact() {
        // 4x4 grid, (1,1) = 1.0, rate 0.25: the seed cell loses everything
        // to its four neighbors, each neighbor receives exactly a quarter.
        let field = point_seed(4, 4, 1, 1).stepped(0.25);

        for y in 0..4 {
            for x in 0..4 {
                let expected = match (x, y) {
                    (1, 1) => 0.0,
                    (0, 1) | (2, 1) | (1, 0) | (1, 2) => 0.25,
                    _ => 0.0,
                };
                assert_eq!(field.get(x, y), expected, "unexpected value at ({x}, {y})");
            }
        }
    }

    #[test]
    fn second_step_redistributes_outward() {
        let field = point_seed(4, 4, 1, 1).stepped(0.25).stepped(0.25);

        // Computed by hand from the rule. The seed cell refills from its
        // four 0.25 neighbors; an edge neighbor like (0,1) keeps a quarter
        // of its value because only three in-bounds neighbors drain it,
        // while an interior neighbor like (2,1) is drained completely.
        assert_eq!(field.get(1, 1), 0.25);
        assert_eq!(field.get(0, 1), 0.0625);
        assert_eq!(field.get(1, 0), 0.0625);
        assert_eq!(field.get(2, 1), 0.0);
        assert_eq!(field.get(1, 2), 0.0);
        assert_eq!(field.get(0, 0), 0.125);
        assert!((field.total() - 1.0).abs() < TOLERANCE as f64);
    }

    #[test]
    fn corner_seed_diffuses_only_into_in_bounds_neighbors() {
        let field = point_seed(4, 4, 0, 0).stepped(0.25);

        // Two off-grid neighbors contribute nothing, so the corner only
        // loses to (1,0) and (0,1).
        assert_eq!(field.get(0, 0), 0.5);
        assert_eq!(field.get(1, 0), 0.25);
        assert_eq!(field.get(0, 1), 0.25);
        assert_eq!(field.get(1, 1), 0.0);
        assert!((field.total() - 1.0).abs() < TOLERANCE as f64);
    }

    #[test]
    fn total_is_conserved_across_many_steps() {
        let mut field = Field::new(32, 32);
        field.seed_disk(16.0, 16.0, 5.0, 1.0);
        let initial_total = field.total();

        for _ in 0..200 {
            field = field.stepped(0.2);
        }
        assert!(
            (field.total() - initial_total).abs() < 1e-3,
            "total drifted from {initial_total} to {}",
            field.total()
        );
    }

    #[test]
    fn zero_field_stays_zero() {
        let mut field = Field::new(16, 16);
        for _ in 0..10 {
            field = field.stepped(0.25);
        }
        assert!(field.values().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn stepping_is_deterministic() {
        let mut seed = Field::new(24, 24);
        seed.seed_disk(12.0, 12.0, 4.0, 1.0);

        let mut a = seed.clone();
        let mut b = seed;
        for _ in 0..50 {
            a = a.stepped(0.25);
            b = b.stepped(0.25);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn stable_rate_keeps_values_bounded() {
        let mut field = Field::new(16, 16);
        field.seed_disk(8.0, 8.0, 3.0, 1.0);

        for _ in 0..1000 {
            field = field.stepped(DiffusionParams::STABLE_RATE);
        }
        assert!(
            field
                .values()
                .iter()
                .all(|&v| v >= -TOLERANCE && v <= 1.0 + TOLERANCE)
        );
    }

    #[test]
    fn disk_seed_covers_expected_cells() {
        let mut field = Field::new(8, 8);
        field.seed_disk(4.0, 4.0, 1.5, 1.0);

        assert_eq!(field.get(3, 3), 1.0);
        assert_eq!(field.get(4, 4), 1.0);
        assert_eq!(field.get(0, 0), 0.0);
        assert_eq!(field.get(7, 7), 0.0);
        assert!(field.total() > 0.0);
    }

    #[test]
    fn asymmetric_grid_uses_row_major_addressing() {
        let mut field = Field::new(5, 3);
        assert_eq!(field.values().len(), 15);

        field.set(4, 2, 7.0);
        field.set(0, 1, 3.0);
        assert_eq!(field.values()[14], 7.0);
        assert_eq!(field.values()[5], 3.0);
        assert_eq!(field.get(4, 2), 7.0);
        assert_eq!(field.get(0, 1), 3.0);

        let roundtrip = Field::from_values(5, 3, field.values().to_vec());
        assert_eq!(roundtrip, field);
    }

    #[test]
    #[should_panic]
    fn zero_width_is_rejected() {
        let _ = Field::new(0, 4);
    }

    #[test]
    #[should_panic]
    fn out_of_range_rate_is_rejected() {
        let _ = DiffusionParams::new(1.5);
    }
}
