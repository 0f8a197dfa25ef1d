//! Polygon detection zones.
//!
//! When zones are configured, an entry is only admitted if the bat's centre
//! lies inside at least one polygon. Zones never affect exits.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PolygonZone {
    vertices: Vec<(f64, f64)>,
}

impl PolygonZone {
    pub fn new(vertices: Vec<(f64, f64)>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(anyhow!(
                "polygon zone needs at least 3 vertices, got {}",
                vertices.len()
            ));
        }
        if vertices.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(anyhow!("polygon zone vertices must be finite"));
        }
        Ok(Self { vertices })
    }

    /// Parse `x1,y1;x2,y2;x3,y3`.
    pub fn parse(value: &str) -> Result<Self> {
        let mut vertices = Vec::new();
        for pair in value.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (x, y) = pair
                .split_once(',')
                .ok_or_else(|| anyhow!("zone vertex '{}' must be x,y", pair))?;
            let x: f64 = x
                .trim()
                .parse()
                .map_err(|_| anyhow!("zone vertex '{}' has a non-numeric x", pair))?;
            let y: f64 = y
                .trim()
                .parse()
                .map_err(|_| anyhow!("zone vertex '{}' has a non-numeric y", pair))?;
            vertices.push((x, y));
        }
        Self::new(vertices)
    }

    pub fn vertices(&self) -> &[(f64, f64)] {
        &self.vertices
    }

    /// Even-odd ray casting. Points on a top or right edge count as inside.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let n = self.vertices.len();
        let mut inside = false;
        let (mut p1x, mut p1y) = self.vertices[0];
        for i in 1..=n {
            let (p2x, p2y) = self.vertices[i % n];
            if y > p1y.min(p2y) && y <= p1y.max(p2y) && x <= p1x.max(p2x) {
                let crosses = if p1x == p2x {
                    true
                } else {
                    // Horizontal edges never reach here.
                    let xinters = (y - p1y) * (p2x - p1x) / (p2y - p1y) + p1x;
                    x <= xinters
                };
                if crosses {
                    inside = !inside;
                }
            }
            p1x = p2x;
            p1y = p2y;
        }
        inside
    }
}

/// Ordered set of zones; the first zone containing a point wins.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneSet {
    zones: Vec<PolygonZone>,
}

impl ZoneSet {
    pub fn new(zones: Vec<PolygonZone>) -> Self {
        Self { zones }
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    /// Index of the first zone containing the point.
    pub fn locate(&self, x: f64, y: f64) -> Option<usize> {
        self.zones.iter().position(|z| z.contains(x, y))
    }
}
