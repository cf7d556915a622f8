//! Path geometry used when a resume or reversal point falls inside an arc.
//!
//! All functions are pure. Coordinates are projected onto the active plane as
//! `(u, v, w)`: the two in-plane axes and the plane normal (see [`Plane::axes`]).
//! Arcs whose endpoints differ along `w` are treated as helices.

use std::f64::consts::TAU;

use thiserror::Error;

use crate::types::{Plane, Point};

const EPS: f64 = 1e-9;
const TANGENT_EPS: f64 = 1e-12;

pub const HELIX_SAMPLES: usize = 360_000;
pub const BISECTION_TOLERANCE: f64 = 1e-8;
pub const BISECTION_MAX_ITERATIONS: usize = 50;

/// Growth attempts for the resume-point search sphere.
pub const MAX_SPHERE_ATTEMPTS: u32 = 12;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("circles are coincident (infinitely many intersections)")]
    CoincidentCircles,
    #[error("no helix intersection found after {attempts} attempts (last sphere radius {last_radius})")]
    NoHelixIntersection { attempts: u32, last_radius: f64 },
}

/// Which of two points is met first when travelling along a helix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelixOrder {
    FirstPoint,
    SecondPoint,
    Same,
}

pub fn project(point: &Point, plane: Plane) -> (f64, f64, f64) {
    let (u, v, w) = plane.axes();
    (point.axis_or_zero(u), point.axis_or_zero(v), point.axis_or_zero(w))
}

/// Writes `(u, v, w)` back onto `base`, leaving its other axes untouched.
pub fn unproject(base: &Point, plane: Plane, coords: (f64, f64, f64)) -> Point {
    let (u, v, w) = plane.axes();
    base.with_axis(u, coords.0).with_axis(v, coords.1).with_axis(w, coords.2)
}

/// +1 when the arc winds counter-clockwise in the projected `(u, v)` frame,
/// -1 otherwise. The XZ plane is seen from -Y, which mirrors its winding.
pub fn angular_sign(plane: Plane, clockwise: bool) -> f64 {
    let sign = if clockwise { -1.0 } else { 1.0 };
    if plane == Plane::XZ { -sign } else { sign }
}

pub fn normalize_angle(angle: f64) -> f64 {
    let a = angle.rem_euclid(TAU);
    if a >= TAU { 0.0 } else { a }
}

/// Rotates `point` about the plane-normal axis through `center` by `angle`
/// (counter-clockwise in the projected frame).
pub fn rotate_about_axis(point: &Point, center: &Point, plane: Plane, angle: f64) -> Point {
    let (pu, pv, pw) = project(point, plane);
    let (cu, cv, _) = project(center, plane);
    let (sin, cos) = angle.sin_cos();
    let (du, dv) = (pu - cu, pv - cv);
    unproject(point, plane, (cu + du * cos - dv * sin, cv + du * sin + dv * cos, pw))
}

/// Intersection of two circles lying in `plane`.
///
/// Returns no points for separated or nested circles, one point when they are
/// tangent and two otherwise. With `clockwise` the first point lies to the
/// right of the vector from `c1` to `c2`; without it the order is swapped. The
/// normal coordinate of the result is the average of the two centers'.
pub fn circle_circle_intersection(
    c1: &Point,
    r1: f64,
    c2: &Point,
    r2: f64,
    plane: Plane,
    clockwise: bool,
) -> Result<Vec<Point>, GeometryError> {
    let (u1, v1, w1) = project(c1, plane);
    let (u2, v2, w2) = project(c2, plane);
    let (du, dv) = (u2 - u1, v2 - v1);
    let d = du.hypot(dv);

    if d < EPS {
        if (r1 - r2).abs() < EPS {
            return Err(GeometryError::CoincidentCircles);
        }
        return Ok(Vec::new());
    }
    if d > r1 + r2 + EPS || d < (r1 - r2).abs() - EPS {
        return Ok(Vec::new());
    }

    let a = (r1 * r1 - r2 * r2 + d * d) / (2.0 * d);
    let h2 = r1 * r1 - a * a;
    let (mu, mv) = (u1 + a * du / d, v1 + a * dv / d);
    let w = (w1 + w2) / 2.0;

    if h2 <= TANGENT_EPS {
        return Ok(vec![unproject(c1, plane, (mu, mv, w))]);
    }
    let h = h2.sqrt();
    let right = unproject(c1, plane, (mu + h * dv / d, mv - h * du / d, w));
    let left = unproject(c1, plane, (mu - h * dv / d, mv + h * du / d, w));
    Ok(if clockwise { vec![right, left] } else { vec![left, right] })
}

/// One turn of a helix starting at angle 0 about `center`:
/// `H(t) = center + R·(cos(s·t), sin(s·t)) + pitch·t/2π` along the normal,
/// with `s` from [`angular_sign`].
#[derive(Debug, Clone, PartialEq)]
pub struct Helix {
    pub center: Point,
    pub radius: f64,
    /// Rise along the plane normal per full turn.
    pub pitch: f64,
    pub plane: Plane,
    pub clockwise: bool,
}

impl Helix {
    fn sign(&self) -> f64 {
        angular_sign(self.plane, self.clockwise)
    }

    pub fn point_at(&self, t: f64) -> Point {
        let (cu, cv, cw) = project(&self.center, self.plane);
        let s = self.sign();
        let coords = (
            cu + self.radius * (s * t).cos(),
            cv + self.radius * (s * t).sin(),
            cw + self.pitch * t / TAU,
        );
        unproject(&self.center, self.plane, coords)
    }

    /// Parameter in `[0, 2π)` at which the helix passes the angular position of `point`.
    pub fn travel(&self, point: &Point) -> f64 {
        let (cu, cv, _) = project(&self.center, self.plane);
        let (pu, pv, _) = project(point, self.plane);
        let angle = normalize_angle((pv - cv).atan2(pu - cu));
        if self.sign() > 0.0 { angle } else { normalize_angle(TAU - angle) }
    }

    /// Height of `point` above the helix start along the normal.
    fn height(&self, point: &Point) -> f64 {
        project(point, self.plane).2 - project(&self.center, self.plane).2
    }
}

/// Points where the sphere meets one turn of `helix`.
///
/// Brackets sign changes of the squared-distance function over
/// [`HELIX_SAMPLES`] samples and refines each by bisection. Roots within
/// [`BISECTION_TOLERANCE`] of one already found are dropped.
pub fn sphere_helix_intersection(sphere_center: &Point, sphere_radius: f64, helix: &Helix) -> Vec<Point> {
    let r2 = sphere_radius * sphere_radius;
    let f = |t: f64| {
        let p = helix.point_at(t);
        let (dx, dy, dz) = (p.x - sphere_center.x, p.y - sphere_center.y, p.z - sphere_center.z);
        dx * dx + dy * dy + dz * dz - r2
    };

    let step = TAU / HELIX_SAMPLES as f64;
    let mut roots: Vec<f64> = Vec::new();
    let push_root = |t: f64, roots: &mut Vec<f64>| {
        if !roots.iter().any(|r| (r - t).abs() < BISECTION_TOLERANCE) {
            roots.push(t);
        }
    };

    let mut t0 = 0.0;
    let mut f0 = f(t0);
    for i in 1..=HELIX_SAMPLES {
        let t1 = i as f64 * step;
        let f1 = f(t1);
        if f0 == 0.0 {
            push_root(t0, &mut roots);
        } else if f0 * f1 < 0.0 {
            push_root(bisect(&f, t0, t1, f0), &mut roots);
        }
        t0 = t1;
        f0 = f1;
    }
    if f0 == 0.0 {
        push_root(t0, &mut roots);
    }

    roots.into_iter().map(|t| helix.point_at(t)).collect()
}

fn bisect(f: &impl Fn(f64) -> f64, mut lo: f64, mut hi: f64, mut f_lo: f64) -> f64 {
    for _ in 0..BISECTION_MAX_ITERATIONS {
        let mid = 0.5 * (lo + hi);
        let f_mid = f(mid);
        if f_mid == 0.0 {
            return mid;
        }
        if (f_mid < 0.0) == (f_lo < 0.0) {
            lo = mid;
            f_lo = f_mid;
        } else {
            hi = mid;
        }
        if hi - lo < BISECTION_TOLERANCE {
            break;
        }
    }
    0.5 * (lo + hi)
}

/// Orders two points by how far along `helix` they lie, breaking angular ties
/// by height in the direction of the pitch.
pub fn helix_point_order(helix: &Helix, p1: &Point, p2: &Point) -> HelixOrder {
    let (t1, t2) = (helix.travel(p1), helix.travel(p2));
    if (t1 - t2).abs() > EPS {
        return if t1 < t2 { HelixOrder::FirstPoint } else { HelixOrder::SecondPoint };
    }
    let (h1, h2) = (helix.height(p1), helix.height(p2));
    if (h1 - h2).abs() <= EPS {
        return HelixOrder::Same;
    }
    let rising = helix.pitch >= 0.0;
    if (h1 < h2) == rising { HelixOrder::FirstPoint } else { HelixOrder::SecondPoint }
}

/// Finds where a growing sphere around `position` first meets the part of
/// `helix` between its start and `sweep` radians of travel.
///
/// The sphere radius is bracketed by the nearest and farthest distance from
/// `position` to that part of the helix. It starts just past the nearest
/// distance and the excess doubles on every miss, never beyond the farthest.
/// When every eligible point is equally far (the centre of a flat arc) the end
/// of the eligible span is returned.
pub fn first_helix_crossing(helix: &Helix, position: &Point, sweep: f64) -> Result<Point, GeometryError> {
    let samples = ((HELIX_SAMPLES as f64 * sweep / TAU).ceil() as usize).max(16);
    let (near, far) = (0..=samples)
        .map(|i| helix.point_at(sweep * i as f64 / samples as f64).distance(position))
        .fold((f64::INFINITY, 0.0_f64), |(near, far), d| (near.min(d), far.max(d)));
    if far - near <= EPS {
        tracing::debug!("all eligible helix points are {:.4} away, joining at the end of the span", near);
        return Ok(helix.point_at(sweep));
    }

    let mut excess = ((far - near) * 1e-3).max(1e-6);
    let mut radius = (near + excess).min(far);
    for attempt in 1..=MAX_SPHERE_ATTEMPTS {
        let hits: Vec<Point> = sphere_helix_intersection(position, radius, helix)
            .into_iter()
            .filter(|p| helix.travel(p) <= sweep + EPS)
            .collect();
        let first = hits.into_iter().reduce(|best, p| match helix_point_order(helix, &p, &best) {
            HelixOrder::FirstPoint => p,
            _ => best,
        });
        if let Some(point) = first {
            tracing::debug!("helix crossing found on attempt {} with sphere radius {:.4}", attempt, radius);
            return Ok(point);
        }
        if attempt < MAX_SPHERE_ATTEMPTS {
            excess *= 2.0;
            radius = (near + excess).min(far);
        }
    }
    Err(GeometryError::NoHelixIntersection { attempts: MAX_SPHERE_ATTEMPTS, last_radius: radius })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, PI};

    fn xy(x: f64, y: f64) -> Point {
        Point::new(x, y, 0.0)
    }

    #[test]
    fn external_tangent_gives_one_point() {
        let points = circle_circle_intersection(&xy(0.0, 0.0), 3.0, &xy(5.0, 0.0), 2.0, Plane::XY, true).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].approx_eq(&xy(3.0, 0.0), 1e-9));
    }

    #[test]
    fn internal_tangent_gives_one_point() {
        let points = circle_circle_intersection(&xy(0.0, 0.0), 5.0, &xy(2.0, 0.0), 3.0, Plane::XY, true).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].approx_eq(&xy(5.0, 0.0), 1e-9));
    }

    #[test]
    fn separated_and_nested_circles_do_not_meet() {
        let apart = circle_circle_intersection(&xy(0.0, 0.0), 1.0, &xy(5.0, 0.0), 1.0, Plane::XY, true).unwrap();
        assert!(apart.is_empty());
        let nested = circle_circle_intersection(&xy(0.0, 0.0), 5.0, &xy(1.0, 0.0), 1.0, Plane::XY, true).unwrap();
        assert!(nested.is_empty());
        let concentric = circle_circle_intersection(&xy(1.0, 1.0), 5.0, &xy(1.0, 1.0), 2.0, Plane::XY, true).unwrap();
        assert!(concentric.is_empty());
    }

    #[test]
    fn coincident_circles_are_an_error() {
        let result = circle_circle_intersection(&xy(1.0, 1.0), 2.0, &xy(1.0, 1.0), 2.0, Plane::XY, false);
        assert_eq!(result, Err(GeometryError::CoincidentCircles));
    }

    #[test]
    fn winding_orders_the_two_points() {
        let cw = circle_circle_intersection(&xy(0.0, 0.0), 5.0, &xy(6.0, 0.0), 5.0, Plane::XY, true).unwrap();
        assert_eq!(cw.len(), 2);
        assert!(cw[0].approx_eq(&xy(3.0, -4.0), 1e-9));
        assert!(cw[1].approx_eq(&xy(3.0, 4.0), 1e-9));
        let ccw = circle_circle_intersection(&xy(0.0, 0.0), 5.0, &xy(6.0, 0.0), 5.0, Plane::XY, false).unwrap();
        assert_eq!(ccw[0], cw[1]);
    }

    #[test]
    fn normal_coordinate_is_averaged() {
        let c1 = Point::new(0.0, 0.0, 2.0);
        let c2 = Point::new(6.0, 0.0, 4.0);
        let points = circle_circle_intersection(&c1, 5.0, &c2, 5.0, Plane::XY, true).unwrap();
        assert!(points.iter().all(|p| (p.z - 3.0).abs() < 1e-12));
    }

    #[test]
    fn other_planes_project_their_own_axes() {
        let c1 = Point::new(0.0, 7.0, 0.0);
        let c2 = Point::new(6.0, 7.0, 0.0);
        let points = circle_circle_intersection(&c1, 5.0, &c2, 5.0, Plane::XZ, true).unwrap();
        assert_eq!(points.len(), 2);
        assert!(points.iter().all(|p| p.y == 7.0 && (p.x - 3.0).abs() < 1e-9 && (p.z.abs() - 4.0).abs() < 1e-9));
    }

    #[test]
    fn flat_helix_meets_a_sphere_twice() {
        let helix = Helix { center: Point::ORIGIN, radius: 5.0, pitch: 0.0, plane: Plane::XY, clockwise: false };
        let hits = sphere_helix_intersection(&xy(5.0, 0.0), 1.0, &helix);
        assert_eq!(hits.len(), 2);
        for p in &hits {
            assert!((p.distance(&xy(5.0, 0.0)) - 1.0).abs() < 1e-6);
            assert!((p.x.hypot(p.y) - 5.0).abs() < 1e-9);
        }
    }

    #[test]
    fn sphere_away_from_the_helix_misses() {
        let helix = Helix { center: Point::ORIGIN, radius: 5.0, pitch: 2.0, plane: Plane::XY, clockwise: true };
        assert!(sphere_helix_intersection(&xy(20.0, 20.0), 1.0, &helix).is_empty());
    }

    #[test]
    fn helix_points_rise_with_pitch() {
        let helix = Helix { center: Point::ORIGIN, radius: 2.0, pitch: 4.0, plane: Plane::XY, clockwise: false };
        let quarter = helix.point_at(FRAC_PI_2);
        assert!(quarter.approx_eq(&Point::new(0.0, 2.0, 1.0), 1e-12));
        let cw = Helix { clockwise: true, ..helix.clone() };
        assert!(cw.point_at(FRAC_PI_2).approx_eq(&Point::new(0.0, -2.0, 1.0), 1e-12));
    }

    #[test]
    fn ordering_follows_winding() {
        let ccw = Helix { center: Point::ORIGIN, radius: 1.0, pitch: 0.0, plane: Plane::XY, clockwise: false };
        let up = xy(0.0, 1.0);
        let down = xy(0.0, -1.0);
        assert_eq!(helix_point_order(&ccw, &up, &down), HelixOrder::FirstPoint);
        let cw = Helix { clockwise: true, ..ccw.clone() };
        assert_eq!(helix_point_order(&cw, &up, &down), HelixOrder::SecondPoint);
        assert_eq!(helix_point_order(&cw, &up, &up), HelixOrder::Same);
    }

    #[test]
    fn xz_plane_flips_the_ordering() {
        let xy_helix = Helix { center: Point::ORIGIN, radius: 1.0, pitch: 0.0, plane: Plane::XY, clockwise: true };
        let xz_helix = Helix { plane: Plane::XZ, ..xy_helix.clone() };
        let a = Point::new(0.0, 0.0, 1.0);
        let b = Point::new(0.0, 0.0, -1.0);
        // in XZ the in-plane axes are (X, Z), so a/b sit at +90 and -90 degrees
        assert_eq!(helix_point_order(&xz_helix, &a, &b), HelixOrder::FirstPoint);
        assert_eq!(helix_point_order(&xy_helix, &xy(0.0, 1.0), &xy(0.0, -1.0)), HelixOrder::SecondPoint);
    }

    #[test]
    fn angle_ties_break_on_height() {
        let helix = Helix { center: Point::ORIGIN, radius: 1.0, pitch: 2.0, plane: Plane::XY, clockwise: false };
        let low = Point::new(1.0, 0.0, 0.0);
        let high = Point::new(1.0, 0.0, 2.0);
        assert_eq!(helix_point_order(&helix, &low, &high), HelixOrder::FirstPoint);
        let falling = Helix { pitch: -2.0, ..helix };
        assert_eq!(helix_point_order(&falling, &low, &high), HelixOrder::SecondPoint);
    }

    #[test]
    fn rotation_is_about_the_normal() {
        let p = rotate_about_axis(&Point::new(2.0, 1.0, 7.0), &Point::new(1.0, 1.0, 0.0), Plane::XY, PI);
        assert!(p.approx_eq(&Point::new(0.0, 1.0, 7.0), 1e-12));
    }

    #[test]
    fn crossing_search_grows_until_it_hits() {
        let helix = Helix { center: Point::ORIGIN, radius: 5.0, pitch: 0.0, plane: Plane::XY, clockwise: false };
        let inside = xy(0.0, 4.0);
        let hit = first_helix_crossing(&helix, &inside, PI).unwrap();
        assert!((hit.x.hypot(hit.y) - 5.0).abs() < 1e-6);
        assert!(hit.x > 0.0, "first crossing lies before the quarter turn");
    }

    #[test]
    fn crossing_search_from_near_the_centre() {
        let helix = Helix { center: Point::ORIGIN, radius: 5.0, pitch: 0.0, plane: Plane::XY, clockwise: false };
        let hit = first_helix_crossing(&helix, &xy(0.0, 0.01), PI).unwrap();
        assert!((hit.x.hypot(hit.y) - 5.0).abs() < 1e-6);
        assert!(hit.y > 4.99, "nearest eligible point is the top of the circle, got {hit:?}");
    }

    #[test]
    fn crossing_search_at_the_exact_centre_takes_the_span_end() {
        let helix = Helix { center: Point::ORIGIN, radius: 5.0, pitch: 0.0, plane: Plane::XZ, clockwise: true };
        let hit = first_helix_crossing(&helix, &Point::ORIGIN, PI).unwrap();
        assert!(hit.approx_eq(&helix.point_at(PI), 1e-9));
    }

    #[test]
    fn crossing_search_on_a_tiny_span_far_away() {
        let helix = Helix { center: Point::ORIGIN, radius: 1.0, pitch: 0.0, plane: Plane::XY, clockwise: false };
        let hit = first_helix_crossing(&helix, &xy(1000.0, 0.0), 1e-6).unwrap();
        assert!(hit.approx_eq(&xy(1.0, 0.0), 1e-5));
    }
}
