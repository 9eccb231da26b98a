//! Bird's-eye-view overlap of rotated boxes.
//!
//! Height is ignored: two boxes overlap when their ground-plane footprints
//! do.  The intersection of two convex footprints is computed exactly by
//! clipping one rectangle against the edges of the other
//! (Sutherland–Hodgman).

type Point = [f32; 2];

/// Ground-plane footprint of a 3-D box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RotatedRect {
    pub cx: f32,
    pub cy: f32,
    /// Extent along the heading direction.
    pub length: f32,
    /// Extent perpendicular to the heading direction.
    pub width: f32,
    pub yaw: f32,
}

impl RotatedRect {
    pub fn new(cx: f32, cy: f32, length: f32, width: f32, yaw: f32) -> Self {
        Self {
            cx,
            cy,
            length,
            width,
            yaw,
        }
    }

    pub fn area(&self) -> f32 {
        self.length.max(0.0) * self.width.max(0.0)
    }

    /// Corners in counter-clockwise order.
    pub fn corners(&self) -> [Point; 4] {
        let (s, c) = self.yaw.sin_cos();
        let (hl, hw) = (self.length * 0.5, self.width * 0.5);
        [(-hl, -hw), (hl, -hw), (hl, hw), (-hl, hw)].map(|(x, y)| {
            [self.cx + x * c - y * s, self.cy + x * s + y * c]
        })
    }

    fn circumradius(&self) -> f32 {
        0.5 * (self.length * self.length + self.width * self.width).sqrt()
    }
}

/// Intersection-over-union of two footprints, in `[0, 1]`.
///
/// Returns `0.0` when the union has no area.
pub fn rotated_iou(a: &RotatedRect, b: &RotatedRect) -> f32 {
    let (area_a, area_b) = (a.area(), b.area());
    if area_a <= 0.0 || area_b <= 0.0 {
        return 0.0;
    }

    let (dx, dy) = (a.cx - b.cx, a.cy - b.cy);
    let reach = a.circumradius() + b.circumradius();
    if dx * dx + dy * dy > reach * reach {
        return 0.0;
    }

    let inter = intersection_area(&a.corners(), &b.corners());
    let union = area_a + area_b - inter;
    if union <= 0.0 {
        return 0.0;
    }
    (inter / union).clamp(0.0, 1.0)
}

/// Area of the intersection of two convex counter-clockwise polygons.
fn intersection_area(subject: &[Point], clip: &[Point]) -> f32 {
    let mut poly: Vec<Point> = subject.to_vec();
    for i in 0..clip.len() {
        if poly.is_empty() {
            break;
        }
        let (a, b) = (clip[i], clip[(i + 1) % clip.len()]);
        let input = std::mem::take(&mut poly);
        for j in 0..input.len() {
            let p = input[j];
            let q = input[(j + 1) % input.len()];
            let (sp, sq) = (side(a, b, p), side(a, b, q));
            if sp >= 0.0 {
                poly.push(p);
            }
            if (sp >= 0.0) != (sq >= 0.0) {
                let t = sp / (sp - sq);
                poly.push([p[0] + t * (q[0] - p[0]), p[1] + t * (q[1] - p[1])]);
            }
        }
    }
    polygon_area(&poly)
}

/// Positive when `p` lies left of the directed edge `a → b`.
fn side(a: Point, b: Point, p: Point) -> f32 {
    (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0])
}

fn polygon_area(poly: &[Point]) -> f32 {
    if poly.len() < 3 {
        return 0.0;
    }
    let twice: f32 = (0..poly.len())
        .map(|i| {
            let (p, q) = (poly[i], poly[(i + 1) % poly.len()]);
            p[0] * q[1] - q[0] * p[1]
        })
        .sum();
    0.5 * twice.abs()
}
