//! Axis-aligned bounding rectangle on the world plane

use crate::core::types::Vec2;

/// Axis-aligned bounds defined by min and max corners
#[derive(Clone, Copy, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Aabb {
    pub min: Vec2,
    pub max: Vec2,
}

impl Aabb {
    /// Create bounds from min and max corners
    pub fn new(min: Vec2, max: Vec2) -> Self {
        Self { min, max }
    }

    /// Create bounds from an origin corner and a size
    pub fn from_origin_size(origin: Vec2, size: Vec2) -> Self {
        Self {
            min: origin,
            max: origin + size,
        }
    }

    /// Get center point
    pub fn center(&self) -> Vec2 {
        (self.min + self.max) * 0.5
    }

    /// Get size (max - min)
    pub fn size(&self) -> Vec2 {
        self.max - self.min
    }

    /// Check if point is inside the bounds (edges inclusive)
    pub fn contains_point(&self, p: Vec2) -> bool {
        p.x >= self.min.x && p.x <= self.max.x &&
        p.y >= self.min.y && p.y <= self.max.y
    }

    /// Check if two bounds overlap
    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x && self.max.x >= other.min.x &&
        self.min.y <= other.max.y && self.max.y >= other.min.y
    }

    /// Euclidean distance from `p` to the closest point of the bounds.
    /// Zero when the point is inside.
    pub fn distance_to_point(&self, p: Vec2) -> f32 {
        let clamped = p.clamp(self.min, self.max);
        clamped.distance(p)
    }

    /// Return merged bounds containing both
    pub fn merged(&self, other: &Aabb) -> Aabb {
        Aabb {
            min: self.min.min(other.min),
            max: self.max.max(other.max),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_and_accessors() {
        let aabb = Aabb::new(Vec2::ZERO, Vec2::ONE);
        assert_eq!(aabb.center(), Vec2::splat(0.5));
        assert_eq!(aabb.size(), Vec2::ONE);
    }

    #[test]
    fn test_contains_point() {
        let aabb = Aabb::from_origin_size(Vec2::ZERO, Vec2::ONE);
        assert!(aabb.contains_point(Vec2::splat(0.5)));
        assert!(aabb.contains_point(Vec2::ONE));
        assert!(!aabb.contains_point(Vec2::splat(2.0)));
    }

    #[test]
    fn test_intersects() {
        let a = Aabb::new(Vec2::ZERO, Vec2::ONE);
        let b = Aabb::new(Vec2::splat(0.5), Vec2::splat(1.5));
        let c = Aabb::new(Vec2::splat(2.0), Vec2::splat(3.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn test_distance_to_point() {
        let aabb = Aabb::new(Vec2::ZERO, Vec2::splat(10.0));
        assert_eq!(aabb.distance_to_point(Vec2::splat(5.0)), 0.0);
        assert_eq!(aabb.distance_to_point(Vec2::new(13.0, 5.0)), 3.0);
    }
}
