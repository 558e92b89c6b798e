//! Geometric kernel binding the inference stages together.
//!
//! Umeyama 5-point similarity estimation (closed form, analytic 2x2 SVD),
//! 2x3 affine inversion, bilinear warping, feathered mask construction and
//! square-box expansion all live here so the model wrappers stay free of
//! numerics.

use crate::types::{Image, Rect};

/// 2x3 affine transform, row-major `[a, b, tx, c, d, ty]`:
/// `x' = a*x + b*y + tx`, `y' = c*x + d*y + ty`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine {
    pub m: [f32; 6],
}

impl Affine {
    pub fn identity() -> Self {
        Self {
            m: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        }
    }

    #[inline]
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        (
            self.m[0] * x + self.m[1] * y + self.m[2],
            self.m[3] * x + self.m[4] * y + self.m[5],
        )
    }

    /// Determinant of the linear 2x2 part.
    pub fn det(&self) -> f32 {
        self.m[0] * self.m[4] - self.m[1] * self.m[3]
    }

    /// Analytic inverse. `None` when the linear part is singular.
    pub fn invert(&self) -> Option<Affine> {
        let det = self.det();
        if det.abs() < 1e-12 {
            return None;
        }
        let inv_det = 1.0 / det;
        let a = self.m[4] * inv_det;
        let b = -self.m[1] * inv_det;
        let c = -self.m[3] * inv_det;
        let d = self.m[0] * inv_det;
        let tx = -(a * self.m[2] + b * self.m[5]);
        let ty = -(c * self.m[2] + d * self.m[5]);
        Some(Affine {
            m: [a, b, tx, c, d, ty],
        })
    }

    /// Scale the output coordinates uniformly, e.g. promoting a 112-space
    /// alignment to 128-space via `scaled(128.0 / 112.0)`.
    pub fn scaled(&self, s: f32) -> Affine {
        Affine {
            m: [
                self.m[0] * s,
                self.m[1] * s,
                self.m[2] * s,
                self.m[3] * s,
                self.m[4] * s,
                self.m[5] * s,
            ],
        }
    }
}

/// Analytic SVD of a 2x2 matrix `[[a, b], [c, d]]`.
///
/// Returns `(u, s, v)` where `u` and `v` are `[cos, sin]` pairs of the
/// angles phi and theta such that `m = rot(phi) * diag(s) * rot(theta)`,
/// with `s[0] >= |s[1]|`; `s[1]` carries the sign of the determinant.
fn svd2x2(a: f64, b: f64, c: f64, d: f64) -> ([f64; 2], [f64; 2], [f64; 2]) {
    let e = (a + d) / 2.0;
    let f = (a - d) / 2.0;
    let g = (c + b) / 2.0;
    let h = (c - b) / 2.0;

    let q = (e * e + h * h).sqrt();
    let r = (f * f + g * g).sqrt();

    let a1 = g.atan2(f);
    let a2 = h.atan2(e);
    let beta = (a2 - a1) / 2.0;
    let gamma = (a2 + a1) / 2.0;

    let u = [gamma.cos(), gamma.sin()];
    let v = [beta.cos(), beta.sin()];
    let s = [q + r, q - r];
    (u, s, v)
}

/// Closed-form least-squares similarity fit (Umeyama) mapping `src` points
/// onto `dst` points. Returns `None` for degenerate inputs.
///
/// The estimated transform is a proper similarity: positive determinant,
/// uniform scale, no shear.
pub fn umeyama(src: &[[f32; 2]], dst: &[[f32; 2]]) -> Option<Affine> {
    let n = src.len();
    if n < 2 || n != dst.len() {
        return None;
    }
    let nf = n as f64;

    let mut mean_src = [0.0f64; 2];
    let mut mean_dst = [0.0f64; 2];
    for i in 0..n {
        mean_src[0] += src[i][0] as f64;
        mean_src[1] += src[i][1] as f64;
        mean_dst[0] += dst[i][0] as f64;
        mean_dst[1] += dst[i][1] as f64;
    }
    mean_src[0] /= nf;
    mean_src[1] /= nf;
    mean_dst[0] /= nf;
    mean_dst[1] /= nf;

    // Covariance of demeaned point sets and the source variance.
    let mut cov = [0.0f64; 4]; // [[0,1],[2,3]] = dst_d * src_d^T
    let mut var_src = 0.0f64;
    for i in 0..n {
        let sx = src[i][0] as f64 - mean_src[0];
        let sy = src[i][1] as f64 - mean_src[1];
        let dx = dst[i][0] as f64 - mean_dst[0];
        let dy = dst[i][1] as f64 - mean_dst[1];
        cov[0] += dx * sx;
        cov[1] += dx * sy;
        cov[2] += dy * sx;
        cov[3] += dy * sy;
        var_src += sx * sx + sy * sy;
    }
    cov[0] /= nf;
    cov[1] /= nf;
    cov[2] /= nf;
    cov[3] /= nf;
    var_src /= nf;

    if var_src < 1e-9 {
        return None;
    }

    let (u, s, v) = svd2x2(cov[0], cov[1], cov[2], cov[3]);

    // Optimal rotation is rot(phi + theta); the sign of s[1] absorbs any
    // reflection so det(R) is always +1.
    let cosd = u[0] * v[0] - u[1] * v[1];
    let sind = u[1] * v[0] + u[0] * v[1];
    let r = [cosd, -sind, sind, cosd];

    let scale = (s[0] + s[1]) / var_src;

    let tx = mean_dst[0] - scale * (r[0] * mean_src[0] + r[1] * mean_src[1]);
    let ty = mean_dst[1] - scale * (r[2] * mean_src[0] + r[3] * mean_src[1]);

    Some(Affine {
        m: [
            (scale * r[0]) as f32,
            (scale * r[1]) as f32,
            tx as f32,
            (scale * r[2]) as f32,
            (scale * r[3]) as f32,
            ty as f32,
        ],
    })
}

/// Bilinear sample of an 8-bit 3-channel image at fractional coordinates.
/// Out-of-bounds reads return black.
#[inline]
pub fn sample_bilinear_u8(img: &Image, x: f32, y: f32) -> [f32; 3] {
    let w = img.width() as i64;
    let h = img.height() as i64;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let mut out = [0.0f32; 3];
    for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            let px = x0 + dx;
            let py = y0 + dy;
            if px < 0 || py < 0 || px >= w || py >= h {
                continue;
            }
            let p = img.pixel(px as u32, py as u32);
            let weight = wx * wy;
            out[0] += p[0] as f32 * weight;
            out[1] += p[1] as f32 * weight;
            out[2] += p[2] as f32 * weight;
        }
    }
    out
}

/// Bilinear sample of a packed HxWx3 `f32` buffer; out of bounds is black.
#[inline]
pub fn sample_bilinear_f32(data: &[f32], w: u32, h: u32, x: f32, y: f32) -> [f32; 3] {
    let wi = w as i64;
    let hi = h as i64;
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let mut out = [0.0f32; 3];
    for (dy, wy) in [(0i64, 1.0 - fy), (1, fy)] {
        for (dx, wx) in [(0i64, 1.0 - fx), (1, fx)] {
            let px = x0 + dx;
            let py = y0 + dy;
            if px < 0 || py < 0 || px >= wi || py >= hi {
                continue;
            }
            let i = (py as usize * w as usize + px as usize) * 3;
            let weight = wx * wy;
            out[0] += data[i] * weight;
            out[1] += data[i + 1] * weight;
            out[2] += data[i + 2] * weight;
        }
    }
    out
}

/// Warp `src` into an `out_w` x `out_h` image. `map_out_to_src` takes output
/// pixel coordinates to source coordinates (the inverse of the forward
/// transform, which is what alignment cropping needs).
pub fn warp_affine(src: &Image, map_out_to_src: &Affine, out_w: u32, out_h: u32) -> Image {
    let mut out = Image::zeroed(out_w, out_h, src.order());
    for y in 0..out_h {
        for x in 0..out_w {
            let (sx, sy) = map_out_to_src.apply(x as f32, y as f32);
            let s = sample_bilinear_u8(src, sx, sy);
            out.set_pixel(
                x,
                y,
                [
                    s[0].round().clamp(0.0, 255.0) as u8,
                    s[1].round().clamp(0.0, 255.0) as u8,
                    s[2].round().clamp(0.0, 255.0) as u8,
                ],
            );
        }
    }
    out
}

/// Hermite smoothstep, clamped to [0, 1].
#[inline]
pub fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Square feathered alpha mask: 1.0 in the interior, smoothstep ramp over
/// `border_frac` of the side on each edge, corners take the per-axis
/// minimum so they fade first.
pub fn feather_mask(size: u32, border_frac: f32) -> Vec<f32> {
    let border = (size as f32 * border_frac).max(1.0);
    let mut mask = vec![0.0f32; size as usize * size as usize];
    for y in 0..size {
        let dy = (y as f32 + 0.5).min(size as f32 - (y as f32 + 0.5));
        let fy = smoothstep(dy / border);
        for x in 0..size {
            let dx = (x as f32 + 0.5).min(size as f32 - (x as f32 + 0.5));
            let fx = smoothstep(dx / border);
            mask[y as usize * size as usize + x as usize] = fx.min(fy);
        }
    }
    mask
}

/// Expand a raw box to a square: `side = max(w, h) * factor`, recentered and
/// clipped to the image. Returns `None` when the clipped result falls below
/// `min_side`.
pub fn expand_to_square(
    rect: &Rect,
    factor: f32,
    min_side: f32,
    img_w: u32,
    img_h: u32,
) -> Option<Rect> {
    let side = rect.width().max(rect.height()) * factor;
    let (cx, cy) = rect.center();
    let half = side / 2.0;
    let expanded = Rect::new(cx - half, cy - half, cx + half, cy + half).clip(img_w, img_h);
    if expanded.width() < min_side || expanded.height() < min_side {
        return None;
    }
    Some(expanded)
}

/// Fill a new image of the given channel order from an existing one,
/// resizing with bilinear sampling.
pub fn resize_bilinear(src: &Image, out_w: u32, out_h: u32) -> Image {
    let sx = src.width() as f32 / out_w as f32;
    let sy = src.height() as f32 / out_h as f32;
    let map = Affine {
        m: [sx, 0.0, (sx - 1.0) / 2.0, 0.0, sy, (sy - 1.0) / 2.0],
    };
    warp_affine(src, &map, out_w, out_h)
}
