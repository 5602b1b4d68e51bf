use serde::{Deserialize, Serialize};

use crate::error::FogError;

/// Segments shorter than this are treated as degenerate.
const MIN_SEGMENT_LEN: f64 = 1e-9;

/// Cross products below this are treated as parallel.
const PARALLEL_EPSILON: f64 = 1e-12;

/// A position in map-local world units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    pub fn distance(&self, other: Point) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }
}

fn cross(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    ax * by - ay * bx
}

/// A single occluding edge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub a: Point,
    pub b: Point,
}

impl Segment {
    pub fn new(a: Point, b: Point) -> Self {
        Self { a, b }
    }

    pub fn length(&self) -> f64 {
        self.a.distance(self.b)
    }

    pub fn is_degenerate(&self) -> bool {
        !self.a.is_finite() || !self.b.is_finite() || self.length() < MIN_SEGMENT_LEN
    }

    /// Where the ray `from -> to` crosses this segment, as a fraction of the ray
    /// length in `[0, 1]`. Segment endpoints count as hits; parallel and collinear
    /// segments never do.
    pub fn ray_hit(&self, from: Point, to: Point) -> Option<f64> {
        let (dx, dy) = (to.x - from.x, to.y - from.y);
        let (sx, sy) = (self.b.x - self.a.x, self.b.y - self.a.y);
        let denom = cross(dx, dy, sx, sy);
        if denom.abs() < PARALLEL_EPSILON {
            return None;
        }

        let (ox, oy) = (self.a.x - from.x, self.a.y - from.y);
        let t = cross(ox, oy, sx, sy) / denom;
        let u = cross(ox, oy, dx, dy) / denom;

        if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
            Some(t)
        } else {
            None
        }
    }

    /// Shortest distance from `p` to any point of the segment.
    pub fn distance_to(&self, p: Point) -> f64 {
        let (sx, sy) = (self.b.x - self.a.x, self.b.y - self.a.y);
        let len2 = sx * sx + sy * sy;
        if len2 == 0.0 {
            return self.a.distance(p);
        }
        let t = (((p.x - self.a.x) * sx + (p.y - self.a.y) * sy) / len2).clamp(0.0, 1.0);
        Point::new(self.a.x + t * sx, self.a.y + t * sy).distance(p)
    }
}

/// Geometry that blocks line of sight, supplied fresh by the token layer on every recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LosBlocker {
    Segment { a: Point, b: Point },
    /// Closed ring; the last point connects back to the first.
    Polygon { points: Vec<Point> },
}

impl LosBlocker {
    pub fn segment(a: Point, b: Point) -> Self {
        LosBlocker::Segment { a, b }
    }

    /// Axis-aligned box, handy for walls and pillars.
    pub fn rect(x: f64, y: f64, w: f64, h: f64) -> Self {
        LosBlocker::Polygon {
            points: vec![
                Point::new(x, y),
                Point::new(x + w, y),
                Point::new(x + w, y + h),
                Point::new(x, y + h),
            ],
        }
    }

    /// The same blocker shifted by `(dx, dy)`.
    pub fn translated(&self, dx: f64, dy: f64) -> Self {
        let shift = |p: &Point| Point::new(p.x + dx, p.y + dy);
        match self {
            LosBlocker::Segment { a, b } => LosBlocker::Segment {
                a: shift(a),
                b: shift(b),
            },
            LosBlocker::Polygon { points } => LosBlocker::Polygon {
                points: points.iter().map(shift).collect(),
            },
        }
    }

    /// Break the blocker into occluding edges.
    pub fn segments(&self) -> Result<Vec<Segment>, FogError> {
        match self {
            LosBlocker::Segment { a, b } => {
                let segment = Segment::new(*a, *b);
                if segment.is_degenerate() {
                    return Err(FogError::MalformedGeometry(format!(
                        "zero-length segment at ({}, {})",
                        a.x, a.y
                    )));
                }
                Ok(vec![segment])
            }
            LosBlocker::Polygon { points } => {
                if points.iter().any(|p| !p.is_finite()) {
                    return Err(FogError::MalformedGeometry(
                        "polygon has non-finite vertices".into(),
                    ));
                }
                let mut ring: Vec<Point> = Vec::with_capacity(points.len());
                for &p in points {
                    if ring.last().map_or(true, |last| last.distance(p) >= MIN_SEGMENT_LEN) {
                        ring.push(p);
                    }
                }
                while ring.len() > 1 && ring[0].distance(ring[ring.len() - 1]) < MIN_SEGMENT_LEN {
                    ring.pop();
                }
                match ring.len() {
                    0 | 1 => Err(FogError::MalformedGeometry(format!(
                        "polygon with {} distinct points",
                        ring.len()
                    ))),
                    2 => Ok(vec![Segment::new(ring[0], ring[1])]),
                    n => Ok((0..n)
                        .map(|i| Segment::new(ring[i], ring[(i + 1) % n]))
                        .collect()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ray_crosses_wall() {
        let wall = Segment::new(Point::new(2.0, -1.0), Point::new(2.0, 1.0));
        let t = wall.ray_hit(Point::new(0.0, 0.0), Point::new(4.0, 0.0)).unwrap();
        assert!((t - 0.5).abs() < 1e-12);

        assert_eq!(wall.ray_hit(Point::new(0.0, 0.0), Point::new(1.0, 0.0)), None);
        assert_eq!(wall.ray_hit(Point::new(0.0, 5.0), Point::new(4.0, 5.0)), None);
    }

    #[test]
    fn endpoints_count_and_parallel_does_not() {
        let wall = Segment::new(Point::new(2.0, 0.0), Point::new(2.0, 1.0));
        assert!(wall.ray_hit(Point::new(0.0, 0.0), Point::new(4.0, 0.0)).is_some());

        let along = Segment::new(Point::new(1.0, 0.0), Point::new(3.0, 0.0));
        assert_eq!(along.ray_hit(Point::new(0.0, 0.0), Point::new(4.0, 0.0)), None);
    }

    #[test]
    fn distance_to_clamps_to_endpoints() {
        let s = Segment::new(Point::new(0.0, 0.0), Point::new(2.0, 0.0));
        assert_eq!(s.distance_to(Point::new(1.0, 3.0)), 3.0);
        assert_eq!(s.distance_to(Point::new(5.0, 4.0)), 5.0);
    }

    #[test]
    fn degenerate_blockers_are_malformed() {
        let p = Point::new(1.0, 1.0);
        assert!(matches!(
            LosBlocker::segment(p, p).segments(),
            Err(FogError::MalformedGeometry(_))
        ));
        assert!(LosBlocker::Polygon { points: vec![p, p, p] }.segments().is_err());
        assert!(LosBlocker::Polygon { points: vec![] }.segments().is_err());
        assert!(LosBlocker::segment(p, Point::new(f64::NAN, 0.0))
            .segments()
            .is_err());
    }

    #[test]
    fn polygon_ring_closes() {
        let segments = LosBlocker::rect(0.0, 0.0, 2.0, 1.0).segments().unwrap();
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[3].b, Point::new(0.0, 0.0));

        let line = LosBlocker::Polygon {
            points: vec![Point::new(0.0, 0.0), Point::new(3.0, 0.0), Point::new(0.0, 0.0)],
        };
        assert_eq!(line.segments().unwrap().len(), 1);
    }

    #[test]
    fn blockers_deserialize_from_tagged_json() {
        let json = r#"[
            {"type": "segment", "a": {"x": 0, "y": 0}, "b": {"x": 1, "y": 0}},
            {"type": "polygon", "points": [{"x": 0, "y": 0}, {"x": 1, "y": 0}, {"x": 1, "y": 1}]}
        ]"#;
        let blockers: Vec<LosBlocker> = serde_json::from_str(json).unwrap();
        assert_eq!(blockers.len(), 2);
        assert_eq!(blockers[1].segments().unwrap().len(), 3);
    }
}
