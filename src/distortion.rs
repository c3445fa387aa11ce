//! Lens distortion models. Given an output texture coordinate, each model
//! returns where to sample the rendered image for the red, green and blue
//! channels.

use crate::types::{Fov, UvTriplet, Vec2};

/// Polynomial barrel distortion as used by panotools and OpenHMD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanotoolsValues {
    /// Polynomial in `|r|`: `k0 + k1 r + k2 r² + k3 r³ + k4 r⁴`.
    pub distortion_k: [f32; 5],
    /// Per-channel scale of the distorted radius (r, g, b).
    pub aberration_k: [f32; 3],
    pub warp_scale: f32,
    /// Lens center in viewport units.
    pub lens_center: Vec2,
    pub viewport_size: Vec2,
}

impl PanotoolsValues {
    pub fn compute(&self, u: f32, v: f32) -> UvTriplet {
        let r = (Vec2::new(u, v).component_mul(&self.viewport_size) - self.lens_center) / self.warp_scale;

        let m = r.norm();
        let k = &self.distortion_k;
        let poly = k[0] + k[1] * m + k[2] * m * m + k[3] * m * m * m + k[4] * m * m * m * m;

        let r_dist = r * poly * self.warp_scale;

        let channel = |aberr: f32| (r_dist * aberr + self.lens_center).component_div(&self.viewport_size);

        UvTriplet {
            r: channel(self.aberration_k[0]),
            g: channel(self.aberration_k[1]),
            b: channel(self.aberration_k[2]),
        }
    }
}

/// Physical description of a phone-in-a-box viewer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardboardArgs {
    pub distortion_k: [f32; 5],
    pub screen_w_pixels: u32,
    pub screen_h_pixels: u32,
    pub screen_w_meters: f32,
    pub screen_h_meters: f32,
    pub inter_lens_distance_meters: f32,
    pub lens_y_center_on_screen_meters: f32,
    pub screen_to_lens_distance_meters: f32,
    pub fov: Fov,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CardboardValues {
    pub distortion_k: [f32; 5],
    pub screen_size: Vec2,
    pub screen_offset: Vec2,
    pub texture_size: Vec2,
    pub texture_offset: Vec2,
}

impl CardboardArgs {
    /// Per-view tan-angle mappings for the left and right half of the screen.
    pub fn calculate(&self) -> [CardboardValues; 2] {
        let d = self.screen_to_lens_distance_meters;
        let fov = &self.fov;

        let texture_size = Vec2::new(
            (-fov.angle_left).tan() + fov.angle_right.tan(),
            fov.angle_up.tan() + (-fov.angle_down).tan(),
        );
        let texture_offset = Vec2::new((-fov.angle_left).tan(), (-fov.angle_down).tan());

        let view = |offset_x_meters: f32| {
            let mut screen_size = Vec2::new(self.screen_w_meters, self.screen_h_meters) / d;
            let screen_offset = Vec2::new(offset_x_meters, self.lens_y_center_on_screen_meters) / d;
            // Each view only covers half of the screen.
            screen_size.x /= 2.0;
            CardboardValues {
                distortion_k: self.distortion_k,
                screen_size,
                screen_offset,
                texture_size,
                texture_offset,
            }
        };

        let left = view((self.screen_w_meters - self.inter_lens_distance_meters) / 2.0);
        let mut right = view((self.screen_w_meters + self.inter_lens_distance_meters) / 2.0);
        right.screen_offset.x -= right.screen_size.x;

        [left, right]
    }
}

impl CardboardValues {
    pub fn compute(&self, u: f32, v: f32) -> UvTriplet {
        let tan = Vec2::new(u, v).component_mul(&self.texture_size) - self.texture_offset;

        let r2 = tan.dot(&tan);
        let mut d = 1.0;
        let mut rn = r2;
        for k in self.distortion_k {
            d += k * rn;
            rn *= r2;
        }

        let uv = (tan * d + self.screen_offset).component_div(&self.screen_size);
        UvTriplet::splat(uv)
    }
}

/// Per-channel distortion of Vive-family lenses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViveValues {
    /// Per channel (r, g, b), four coefficients each.
    pub coefficients: [[f32; 4]; 3],
    pub center: [Vec2; 3],
    pub aspect_x_over_y: f32,
    pub grow_for_undistort: f32,
    /// Squared radius past which the polynomial is no longer valid; the
    /// distortion is held at its value on this circle beyond it.
    pub undistort_r2_cutoff: f32,
}

impl ViveValues {
    pub fn compute(&self, u: f32, v: f32) -> UvTriplet {
        let common = 0.5 / (1.0 + self.grow_for_undistort);
        let factor = Vec2::new(common, common * self.aspect_x_over_y);
        let half = Vec2::new(0.5, 0.5);

        let channel = |i: usize| {
            let mut tc = Vec2::new(2.0 * u - 1.0, 2.0 * v - 1.0);
            tc.y /= self.aspect_x_over_y;
            tc -= self.center[i];

            let r2 = tc.dot(&tc).min(self.undistort_r2_cutoff);
            let [k1, k2, k3, k4] = self.coefficients[i];
            let d_inv = ((r2 * k4 + k3) * r2 + k2) * r2 + k1;
            let d = 1.0 / d_inv;

            half + ((tc + self.center[i]) * d).component_mul(&factor)
        };

        UvTriplet {
            r: channel(0),
            g: channel(1),
            b: channel(2),
        }
    }
}

/// The distortion model of one device, picked at creation.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Distortion {
    #[default]
    None,
    Panotools([PanotoolsValues; 2]),
    Cardboard([CardboardValues; 2]),
    Vive([ViveValues; 2]),
}

impl Distortion {
    /// Distorted coordinates for `view`. Views past the second reuse the
    /// second view's parameters.
    pub fn compute(&self, view: usize, u: f32, v: f32) -> UvTriplet {
        let i = view.min(1);
        match self {
            Distortion::None => UvTriplet::splat(Vec2::new(u, v)),
            Distortion::Panotools(vals) => vals[i].compute(u, v),
            Distortion::Cardboard(vals) => vals[i].compute(u, v),
            Distortion::Vive(vals) => vals[i].compute(u, v),
        }
    }
}

/// Splits one total field of view across an off-center viewpoint.
///
/// `w_1` is the part of `w_total` on the negative side of the viewpoint.
/// Returns `(theta_1, theta_2, distance)`.
fn solve_triangle(w_total: f64, w_1: f64, theta_total: f64) -> Option<(f64, f64, f64)> {
    let w_2 = w_total - w_1;
    let u = w_2 / w_1;
    let v = theta_total.tan();

    let b = u + 1.0;
    let root = (b * b + 4.0 * u * v * v).sqrt();
    let two_a = 2.0 * v;

    let plus = ((-b + root) / two_a).atan();
    let minus = ((-b - root) / two_a).atan();

    let theta_2 = if plus > 0.0 && plus < theta_total {
        plus
    } else if minus > 0.0 && minus < theta_total {
        minus
    } else {
        return None;
    };

    Some((theta_total - theta_2, theta_2, w_2 / theta_2.tan()))
}

/// Field of view of one eye of a flat panel HMD.
///
/// If `vertfov_total` is zero the vertical angles are derived from the
/// viewing distance solved for the horizontal axis.
pub fn compute_fovs(
    w_total: f64,
    w_1: f64,
    horizfov_total: f64,
    h_total: f64,
    h_1: f64,
    vertfov_total: f64,
) -> Option<Fov> {
    let (theta_1, theta_2, d) = solve_triangle(w_total, w_1, horizfov_total)?;

    let (phi_1, phi_2) = if vertfov_total == 0.0 {
        ((h_1 / d).atan(), ((h_total - h_1) / d).atan())
    } else {
        let (p1, p2, _) = solve_triangle(h_total, h_1, vertfov_total)?;
        (p1, p2)
    };

    Some(Fov {
        angle_left: -theta_1 as f32,
        angle_right: theta_2 as f32,
        angle_up: phi_2 as f32,
        angle_down: -phi_1 as f32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec2, b: Vec2) -> bool {
        (a - b).norm() < 1e-5
    }

    #[test]
    fn test_none_is_identity() {
        let t = Distortion::None.compute(0, 0.25, 0.75);
        assert_eq!(t, UvTriplet::splat(Vec2::new(0.25, 0.75)));
    }

    #[test]
    fn test_panotools_center_maps_to_itself() {
        let vals = PanotoolsValues {
            distortion_k: [0.0; 5],
            aberration_k: [1.0; 3],
            warp_scale: 1.0,
            lens_center: Vec2::new(0.5, 0.5),
            viewport_size: Vec2::new(1.0, 1.0),
        };
        let d = Distortion::Panotools([vals, vals]);
        let t = d.compute(0, 0.5, 0.5);
        let c = Vec2::new(0.5, 0.5);
        assert!(close(t.r, c) && close(t.g, c) && close(t.b, c));
    }

    #[test]
    fn test_panotools_identity_polynomial() {
        let vals = PanotoolsValues {
            distortion_k: [1.0, 0.0, 0.0, 0.0, 0.0],
            aberration_k: [0.99, 1.0, 1.01],
            warp_scale: 0.5,
            lens_center: Vec2::new(0.06, 0.04),
            viewport_size: Vec2::new(0.12, 0.08),
        };
        let t = vals.compute(0.2, 0.9);
        assert!(close(t.g, Vec2::new(0.2, 0.9)));
        // Red pulled toward the center, blue pushed away.
        assert!(t.r.x > 0.2 && t.b.x < 0.2);
    }

    #[test]
    fn test_cardboard_center_of_lens() {
        let half = 45f32.to_radians();
        let args = CardboardArgs {
            distortion_k: [0.441, 0.156, 0.0, 0.0, 0.0],
            screen_w_pixels: 1280,
            screen_h_pixels: 720,
            screen_w_meters: 0.13,
            screen_h_meters: 0.07,
            inter_lens_distance_meters: 0.06,
            lens_y_center_on_screen_meters: 0.035,
            screen_to_lens_distance_meters: 0.042,
            fov: Fov {
                angle_left: -half,
                angle_right: half,
                angle_up: half,
                angle_down: -half,
            },
        };
        let [l, r] = args.calculate();
        // The center of the texture looks straight through the lens.
        let tl = l.compute(0.5, 0.5);
        let expected_x = (0.13 - 0.06) / 2.0 / 0.042 / (0.13 / 0.042 / 2.0);
        assert!((tl.g.x - expected_x).abs() < 1e-4);
        assert!((tl.g.y - 0.5).abs() < 1e-4);
        // Right view is the mirror image of the left one.
        let tr = r.compute(0.5, 0.5);
        assert!((tr.g.x - (1.0 - expected_x)).abs() < 1e-4);
    }

    #[test]
    fn test_vive_identity_coefficients() {
        let vals = ViveValues {
            coefficients: [[1.0, 0.0, 0.0, 0.0]; 3],
            center: [Vec2::zeros(); 3],
            aspect_x_over_y: 1.0,
            grow_for_undistort: 0.0,
            undistort_r2_cutoff: 1.0,
        };
        let t = vals.compute(0.3, 0.6);
        assert!(close(t.r, Vec2::new(0.3, 0.6)));
        assert!(close(t.b, Vec2::new(0.3, 0.6)));
    }

    #[test]
    fn test_vive_clamps_past_cutoff() {
        let vals = ViveValues {
            coefficients: [[1.0, 0.0, 0.0, -1.0]; 3],
            center: [Vec2::zeros(); 3],
            aspect_x_over_y: 1.0,
            grow_for_undistort: 0.0,
            undistort_r2_cutoff: 0.5,
        };
        // Corner: r² = 2 would flip the sign of the polynomial.
        let d = 1.0 / (1.0 - 0.5f32.powi(3));
        let t = vals.compute(1.0, 1.0);
        assert!(close(t.g, Vec2::new(0.5 + 0.5 * d, 0.5 + 0.5 * d)));
        // Inside the cutoff nothing changes.
        let d = 1.0 / (1.0 - 0.04f32.powi(3));
        let t = vals.compute(0.6, 0.5);
        assert!(close(t.r, Vec2::new(0.5 + 0.1 * d, 0.5)));
    }

    #[test]
    fn test_symmetric_fov_splits_in_half() {
        let total = 80f64.to_radians();
        let fov = compute_fovs(0.1, 0.05, total, 0.1, 0.05, total).unwrap();
        let half = 40f32.to_radians();
        assert!((fov.angle_left + half).abs() < 1e-5);
        assert!((fov.angle_right - half).abs() < 1e-5);
        assert!((fov.angle_up - half).abs() < 1e-5);
        assert!((fov.angle_down + half).abs() < 1e-5);
    }
}
