//! Entity model (spec §4.F) — pure value types plus the geometry helpers
//! the stats aggregator and raw-store writer need. No ownership edges
//! between entities: a way never holds a reference to its nodes, only
//! their ids (spec §9, "Shared mutable pointer graphs").

use std::collections::HashMap;

use chrono::NaiveDateTime;
use geo::{LineString, Point, Polygon};

pub type Tags = HashMap<String, String>;

/// Mean earth radius in kilometres, per spec §4.F.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two (lon, lat) points, in kilometres.
pub fn haversine_km(a: Point<f64>, b: Point<f64>) -> f64 {
    let (lon1, lat1) = (a.x().to_radians(), a.y().to_radians());
    let (lon2, lat2) = (b.x().to_radians(), b.y().to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().clamp(-1.0, 1.0).asin()
}

/// The per-entity action, inherited from the enclosing `<create>` /
/// `<modify>` / `<delete>` element. `None` covers entities built outside
/// an osmChange document (a raw store row reconstructed for comparison).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Create,
    Modify,
    Remove,
}

/// The action an `OsmChange` groups its entities under. A strict subset of
/// `Action` — `osmChange` documents never contain a bare `none` block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Create,
    Modify,
    Remove,
}

impl From<ChangeAction> for Action {
    fn from(action: ChangeAction) -> Self {
        match action {
            ChangeAction::Create => Action::Create,
            ChangeAction::Modify => Action::Modify,
            ChangeAction::Remove => Action::Remove,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OsmNode {
    pub id: i64,
    pub version: u32,
    pub changeset: i64,
    pub uid: i64,
    pub user: String,
    pub timestamp: NaiveDateTime,
    /// (lon, lat) — see spec §9's (lon=X, lat=Y) convention note.
    pub point: Point<f64>,
    pub tags: Tags,
    pub action: Action,
}

impl OsmNode {
    pub fn lon(&self) -> f64 {
        self.point.x()
    }

    pub fn lat(&self) -> f64 {
        self.point.y()
    }
}

#[derive(Debug, Clone)]
pub struct OsmWay {
    pub id: i64,
    pub version: u32,
    pub changeset: i64,
    pub uid: i64,
    pub user: String,
    pub timestamp: NaiveDateTime,
    pub refs: Vec<i64>,
    pub tags: Tags,
    pub action: Action,
    /// Built by the node-cache resolver (spec §4.G); empty until resolved.
    pub linestring: LineString<f64>,
    /// `Some` only once `is_closed()` and the resolved linestring forms a
    /// valid ring.
    pub polygon: Option<Polygon<f64>>,
}

impl OsmWay {
    pub fn new(
        id: i64,
        version: u32,
        changeset: i64,
        uid: i64,
        user: String,
        timestamp: NaiveDateTime,
        refs: Vec<i64>,
        tags: Tags,
        action: Action,
    ) -> Self {
        Self {
            id,
            version,
            changeset,
            uid,
            user,
            timestamp,
            refs,
            tags,
            action,
            linestring: LineString::new(Vec::new()),
            polygon: None,
        }
    }

    /// A way is closed iff it has at least 4 refs and the first equals the
    /// last (spec §4.F). This is checked on `refs`, not on the resolved
    /// linestring, since refs are always fully known even before any node
    /// lookup happens.
    pub fn is_closed(&self) -> bool {
        self.refs.len() >= 4 && self.refs.first() == self.refs.last()
    }

    pub fn num_points(&self) -> usize {
        self.refs.len()
    }

    /// Whether this way belongs in `ways_poly` (closed, at least 3 unique
    /// refs) or `ways_line` (spec §3 invariant).
    pub fn is_polygon_eligible(&self) -> bool {
        self.is_closed() && unique_ref_count(&self.refs) >= 3
    }

    /// Sum of great-circle segment lengths over the resolved linestring,
    /// in kilometres (spec §4.F/§4.I).
    pub fn length_km(&self) -> f64 {
        self.linestring
            .points()
            .collect::<Vec<_>>()
            .windows(2)
            .map(|pair| haversine_km(pair[0], pair[1]))
            .sum()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn has_tags(&self) -> bool {
        !self.tags.is_empty()
    }
}

fn unique_ref_count(refs: &[i64]) -> usize {
    let mut seen: Vec<i64> = refs.to_vec();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone)]
pub struct RelationMember {
    pub member_type: MemberType,
    pub member_ref: i64,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct OsmRelation {
    pub id: i64,
    pub version: u32,
    pub changeset: i64,
    pub uid: i64,
    pub user: String,
    pub timestamp: NaiveDateTime,
    pub members: Vec<RelationMember>,
    pub tags: Tags,
    pub action: Action,
}

/// One `<create>`/`<modify>`/`<delete>` block of an osmChange document.
#[derive(Debug, Clone)]
pub struct OsmChange {
    pub action: ChangeAction,
    pub nodes: Vec<OsmNode>,
    pub ways: Vec<OsmWay>,
    pub relations: Vec<OsmRelation>,
}

impl OsmChange {
    pub fn new(action: ChangeAction) -> Self {
        Self {
            action,
            nodes: Vec::new(),
            ways: Vec::new(),
            relations: Vec::new(),
        }
    }
}

/// Per-user counters for one change file (spec §3).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeStats {
    pub pois_added: u64,
    pub pois_modified: u64,
    pub buildings_added: u64,
    pub buildings_modified: u64,
    pub roads_added: u64,
    pub roads_modified: u64,
    pub roads_km_added: f64,
    pub roads_km_modified: f64,
    pub waterways_added: u64,
    pub waterways_modified: u64,
    pub waterways_km_added: f64,
    pub waterways_km_modified: f64,
}

/// A full `osmChange` document: an ordered list of changes, the node
/// coordinate cache shared across them, and per-user derived stats.
#[derive(Debug, Clone, Default)]
pub struct OsmChangeFile {
    pub changes: Vec<OsmChange>,
    pub nodecache: HashMap<i64, Point<f64>>,
    pub userstats: HashMap<i64, ChangeStats>,
}

impl OsmChangeFile {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(lon: f64, lat: f64) -> Point<f64> {
        Point::new(lon, lat)
    }

    #[test]
    fn way_is_closed_requires_four_refs_and_matching_ends() {
        let mut way = OsmWay::new(
            1,
            1,
            1,
            1,
            "a".into(),
            NaiveDateTime::default(),
            vec![1, 2, 3],
            Tags::default(),
            Action::Create,
        );
        assert!(!way.is_closed(), "triangle with no closing ref isn't closed");
        way.refs = vec![1, 2, 3, 1];
        assert!(way.is_closed());
        assert_eq!(way.num_points(), 4);
    }

    #[test]
    fn linestring_length_matches_ref_count_when_fully_resolved() {
        let mut way = OsmWay::new(
            1,
            1,
            1,
            1,
            "a".into(),
            NaiveDateTime::default(),
            vec![1, 2, 3, 1],
            Tags::default(),
            Action::Create,
        );
        way.linestring = LineString::new(vec![
            point(0.0, 0.0).into(),
            point(0.0, 0.001).into(),
            point(0.001, 0.001).into(),
            point(0.0, 0.0).into(),
        ]);
        assert_eq!(way.linestring.0.len(), way.refs.len());
        assert!(way.length_km() > 0.0);
    }

    #[test]
    fn haversine_is_symmetric_and_zero_for_identical_points() {
        let a = point(-1.375, 50.917);
        let b = point(10.98, 45.43);
        assert_eq!(haversine_km(a, a), 0.0);
        assert!((haversine_km(a, b) - haversine_km(b, a)).abs() < 1e-9);
    }

    #[test]
    fn polygon_eligibility_requires_three_unique_refs() {
        let mut way = OsmWay::new(
            1,
            1,
            1,
            1,
            "a".into(),
            NaiveDateTime::default(),
            vec![1, 1, 1, 1],
            Tags::default(),
            Action::Create,
        );
        assert!(way.is_closed());
        assert!(!way.is_polygon_eligible(), "degenerate ring has one unique ref");
        way.refs = vec![1, 2, 3, 1];
        assert!(way.is_polygon_eligible());
    }
}
