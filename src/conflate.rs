//! Conflation engine (spec §4.J) — flags a newly-stored polygon way
//! against the existing `boundary` view, and separately sweeps the
//! `boundary` view against itself, classifying every overlap as a
//! `duplicate` or a plain `overlaping` (spelling kept from the original
//! status vocabulary — spec §9/GLOSSARY). All area arithmetic happens in
//! SRID 2167 (an equal-area projection), done in SQL; this module only
//! classifies the numbers SQL hands back.
use crate::catalog::PgPool;
use crate::error::Result;
use crate::model::OsmWay;

/// `way.polygon` only ever holds its outer ring (spec §4.G never builds
/// interior rings), so the WKT is always a single-ring `POLYGON`.
fn polygon_wkt(way: &OsmWay) -> String {
    let coords: Vec<String> = way
        .linestring
        .points()
        .map(|p| format!("{:.12} {:.12}", p.x(), p.y()))
        .collect();
    format!("POLYGON(({}))", coords.join(", "))
}

const AREA_RATIO_TOLERANCE: f64 = 1e-3;
const DUPLICATE_AREA_RATIO_MIN: f64 = 0.5;
const DUPLICATE_AREA_RATIO_MAX: f64 = 2.0;
const DUPLICATE_INTERSECTION_MIN_M2: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflationKind {
    Duplicate,
    Overlapping,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConflationMatch {
    pub way_id: i64,
    pub other_id: i64,
    pub intersection_area_m2: f64,
    pub kind: ConflationKind,
}

/// Classify one overlapping pair from its intersection area and the two
/// polygons' own areas (all already in square metres, SRID 2167).
/// `duplicate` requires both a near-equal footprint (ratio within
/// `[0.5, 2.0]`, ±`AREA_RATIO_TOLERANCE`) and a non-trivial intersection
/// (> 30 m²); anything else that overlaps at all is `overlaping`.
pub fn classify(intersection_area_m2: f64, area_a_m2: f64, area_b_m2: f64) -> ConflationKind {
    let ratio = if area_a_m2 >= area_b_m2 {
        area_a_m2 / area_b_m2
    } else {
        area_b_m2 / area_a_m2
    };
    let similar_area = ratio >= DUPLICATE_AREA_RATIO_MIN - AREA_RATIO_TOLERANCE
        && ratio <= DUPLICATE_AREA_RATIO_MAX + AREA_RATIO_TOLERANCE;
    if similar_area && intersection_area_m2 > DUPLICATE_INTERSECTION_MIN_M2 {
        ConflationKind::Duplicate
    } else {
        ConflationKind::Overlapping
    }
}

pub struct ConflationEngine {
    pool: PgPool,
}

impl ConflationEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Register the `boundary` view scoped to one priority area, the way
    /// the original `CREATE VIEW boundary AS ... WHERE ST_Within(...)`
    /// does.
    pub fn create_boundary_view(&self, priority_area_ewkt: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        conn.batch_execute(&format!(
            "DROP VIEW IF EXISTS boundary; \
             CREATE VIEW boundary AS \
             SELECT osm_id, building, highway, amenity, way \
             FROM planet_osm_polygon \
             WHERE ST_Within(way, ST_MakeValid(ST_GeomFromEWKT('{priority_area_ewkt}')))"
        ))?;
        Ok(())
    }

    /// Compare a freshly stored polygon way against every existing
    /// building in `boundary` it overlaps.
    pub fn check_against_boundary(&self, way: &OsmWay) -> Result<Vec<ConflationMatch>> {
        if way.polygon.is_none() {
            return Ok(Vec::new());
        }
        let wkt = format!("SRID=4326;{}", polygon_wkt(way));
        let mut conn = self.pool.get()?;
        let rows = conn.query(
            "SELECT ST_Area(ST_Transform(ST_Intersection(ST_GeomFromEWKT($1), way), 2167)) AS intersection, \
                    ST_Area(ST_Transform(ST_GeomFromEWKT($1), 2167)) AS new_area, \
                    osm_id, \
                    ST_Area(ST_Transform(way, 2167)) AS existing_area \
             FROM boundary \
             WHERE ST_Overlaps(ST_GeomFromEWKT($1), way) AND building IS NOT NULL",
            &[&wkt],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let intersection: f64 = row.get("intersection");
                let new_area: f64 = row.get("new_area");
                let other_id: i64 = row.get("osm_id");
                let existing_area: f64 = row.get("existing_area");
                ConflationMatch {
                    way_id: way.id,
                    other_id,
                    intersection_area_m2: intersection,
                    kind: classify(intersection, new_area, existing_area),
                }
            })
            .collect())
    }

    /// Sweep `boundary` against itself. Every overlapping pair is emitted
    /// twice, once from each side, mirroring the original's symmetric
    /// `status1`/`status2` push (spec §4.J).
    pub fn existing_overlaps(&self) -> Result<Vec<ConflationMatch>> {
        let mut conn = self.pool.get()?;
        let rows = conn.query(
            "SELECT ST_Area(ST_Transform(ST_Intersection(g1.way, g2.way), 2167)) AS intersection, \
                    g1.osm_id AS id1, ST_Area(ST_Transform(g1.way, 2167)) AS area1, \
                    g2.osm_id AS id2, ST_Area(ST_Transform(g2.way, 2167)) AS area2 \
             FROM boundary AS g1, boundary AS g2 \
             WHERE g1.osm_id < g2.osm_id AND ST_Overlaps(g1.way, g2.way)",
            &[],
        )?;
        let mut matches = Vec::with_capacity(rows.len() * 2);
        for row in rows {
            let intersection: f64 = row.get("intersection");
            let id1: i64 = row.get("id1");
            let area1: f64 = row.get("area1");
            let id2: i64 = row.get("id2");
            let area2: f64 = row.get("area2");
            let kind = classify(intersection, area1, area2);
            matches.push(ConflationMatch {
                way_id: id1,
                other_id: id2,
                intersection_area_m2: intersection,
                kind,
            });
            matches.push(ConflationMatch {
                way_id: id2,
                other_id: id1,
                intersection_area_m2: intersection,
                kind,
            });
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_footprints_with_real_overlap_are_duplicates() {
        assert_eq!(classify(50.0, 100.0, 100.0), ConflationKind::Duplicate);
    }

    #[test]
    fn ratio_boundary_is_inclusive_within_tolerance() {
        assert_eq!(classify(50.0, 200.0, 100.0), ConflationKind::Duplicate);
        assert_eq!(classify(50.0, 200.0007, 100.0), ConflationKind::Duplicate);
    }

    #[test]
    fn wildly_different_footprints_are_overlapping_not_duplicate() {
        assert_eq!(classify(50.0, 1000.0, 100.0), ConflationKind::Overlapping);
    }

    #[test]
    fn trivial_intersection_is_overlapping_even_with_equal_area() {
        assert_eq!(classify(5.0, 100.0, 100.0), ConflationKind::Overlapping);
    }

    #[test]
    fn classification_is_symmetric_under_area_swap() {
        assert_eq!(classify(50.0, 100.0, 150.0), classify(50.0, 150.0, 100.0));
    }
}
