//! Quality engine, tag/geometry half (spec §3 `ValidateStatus` / §4.I-J) —
//! a per-feature quality record combining tag-completeness checks with
//! whatever the conflation engine (`conflate.rs`) found for the same
//! feature. Emitted as data, never as an error (spec §7): a malformed
//! feature still gets written to the store, it's just flagged here for a
//! downstream consumer to act on.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use geo::{Centroid, Point};

use crate::conflate::ConflationKind;
use crate::model::{OsmNode, OsmWay};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjType {
    Node,
    Way,
    Relation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFlag {
    NoTags,
    Complete,
    Incomplete,
    BadValue,
    Correct,
    BadGeom,
    Orphan,
    Overlapping,
    Duplicate,
}

/// Per-feature quality record (spec §3). `center`/`angle` are only
/// meaningful for ways; a node's `center` is its own point and its
/// `angle` is always 0.
#[derive(Debug, Clone)]
pub struct ValidateStatus {
    pub osm_id: i64,
    pub objtype: ObjType,
    pub user_id: i64,
    pub change_id: i64,
    pub timestamp: NaiveDateTime,
    pub center: Point<f64>,
    pub angle: f64,
    pub status: HashSet<StatusFlag>,
    pub values: HashSet<String>,
}

impl ValidateStatus {
    fn new(osm_id: i64, objtype: ObjType, user_id: i64, change_id: i64, timestamp: NaiveDateTime) -> Self {
        Self {
            osm_id,
            objtype,
            user_id,
            change_id,
            timestamp,
            center: Point::new(0.0, 0.0),
            angle: 0.0,
            status: HashSet::new(),
            values: HashSet::new(),
        }
    }

    pub fn has_status(&self, flag: StatusFlag) -> bool {
        self.status.contains(&flag)
    }

    /// Fold in a conflation finding for this same feature (spec §4.J);
    /// `overlaping`/`duplicate` are the only two status flags the
    /// conflation engine, rather than the tag/geometry checks here, ever
    /// contributes.
    pub fn mark_conflation(&mut self, kind: ConflationKind) {
        self.status.insert(match kind {
            ConflationKind::Duplicate => StatusFlag::Duplicate,
            ConflationKind::Overlapping => StatusFlag::Overlapping,
        });
    }
}

/// A tag value is bad if it's empty or all whitespace — the one
/// value-level check the original's `checkTag` stub (disabled with a
/// `FIXME` in the visible source) never got around to implementing, but
/// every validator in the JOSM/OSMose family referenced in `validate.hh`'s
/// comment block includes it.
fn is_bad_value(value: &str) -> bool {
    value.trim().is_empty()
}

/// Check a standalone POI node (spec: "A node that is part of a way
/// shouldn't have any tags, this is to check actual POIs"). A node with
/// no tags at all isn't wrong, just uninteresting to validate further.
pub fn check_node(node: &OsmNode) -> ValidateStatus {
    let mut result = ValidateStatus::new(node.id, ObjType::Node, node.uid, node.changeset, node.timestamp);
    result.center = node.point;
    if node.tags.is_empty() {
        result.status.insert(StatusFlag::NoTags);
        return result;
    }
    let mut any_bad = false;
    for (k, v) in &node.tags {
        if is_bad_value(v) {
            any_bad = true;
            result.values.insert(format!("{k}={v}"));
        }
    }
    result.status.insert(if any_bad { StatusFlag::BadValue } else { StatusFlag::Correct });
    result.status.insert(StatusFlag::Complete);
    result
}

/// Check a way: tags should always be present (spec §4.I's "might be a
/// building" warning already covers the untagged-pentagon heuristic at
/// the stats layer; this is the structured-data counterpart), and its
/// geometry must actually resolve and, for an area tag, close.
pub fn check_way(way: &OsmWay) -> ValidateStatus {
    let mut result = ValidateStatus::new(way.id, ObjType::Way, way.uid, way.changeset, way.timestamp);
    result.center = way.linestring.centroid().unwrap_or(Point::new(0.0, 0.0));
    result.angle = corner_angle(way);

    if way.tags.is_empty() {
        result.status.insert(StatusFlag::NoTags);
    } else {
        let mut any_bad = false;
        let mut any_missing = false;
        for (k, v) in &way.tags {
            if is_bad_value(v) {
                any_bad = true;
                result.values.insert(format!("{k}={v}"));
            }
        }
        if any_bad {
            result.status.insert(StatusFlag::BadValue);
        } else {
            result.status.insert(StatusFlag::Correct);
        }
        if way.refs.len() < 2 {
            any_missing = true;
        }
        result.status.insert(if any_missing { StatusFlag::Incomplete } else { StatusFlag::Complete });
    }

    if way.refs.len() < 2 {
        result.status.insert(StatusFlag::BadGeom);
    } else if way.linestring.0.len() < way.refs.len() {
        // Fewer resolved points than refs: at least one ref never made it
        // into the node cache (spec §4.G's "missing-ref policy").
        result.status.insert(StatusFlag::Orphan);
    } else if way.tag("building").is_some() && !way.is_closed() {
        result.status.insert(StatusFlag::BadGeom);
    }

    result
}

/// Angle (degrees) between the first two segments of a way's resolved
/// linestring. Grounded on `validate.hh::cornerAngle`: a near-circular
/// building (five-plus points, shallow turn angle) is excluded from the
/// overlap check there, since a round footprint routinely "overlaps" a
/// neighboring building's corner without being a real duplicate.
fn corner_angle(way: &OsmWay) -> f64 {
    let points: Vec<Point<f64>> = way.linestring.points().collect();
    if points.len() < 3 {
        return 0.0;
    }
    let (x1, y1) = points[0].x_y();
    let (x2, y2) = points[1].x_y();
    let (x3, y3) = points[2].x_y();
    let s1 = (y2 - y1) / (x2 - x1);
    let s2 = (y3 - y2) / (x3 - x2);
    ((s2 - s1) / (1.0 + s2 * s1)).atan().to_degrees()
}

/// True when a building-tagged way is round enough that an overlap with a
/// neighbor shouldn't be treated as a duplicate footprint (spec §4.J
/// design note grounded in `validate.hh::overlaps`'s round-building skip).
pub fn looks_round(way: &OsmWay) -> bool {
    way.num_points() > 5 && corner_angle(way).abs() < 30.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, Tags};
    use geo::LineString;

    fn way(refs: Vec<i64>, tags: Tags) -> OsmWay {
        OsmWay::new(1, 1, 1, 1, "a".into(), NaiveDateTime::default(), refs, tags, Action::Create)
    }

    #[test]
    fn untagged_way_is_flagged_notags() {
        let w = way(vec![1, 2, 3, 1], Tags::default());
        let status = check_way(&w);
        assert!(status.has_status(StatusFlag::NoTags));
    }

    #[test]
    fn empty_tag_value_is_badvalue() {
        let mut tags = Tags::new();
        tags.insert("building".into(), "  ".into());
        let w = way(vec![1, 2, 3, 1], tags);
        let status = check_way(&w);
        assert!(status.has_status(StatusFlag::BadValue));
        assert!(status.values.contains("building=  "));
    }

    #[test]
    fn unresolved_refs_are_orphan() {
        let mut tags = Tags::new();
        tags.insert("highway".into(), "residential".into());
        let mut w = way(vec![1, 2, 3], tags);
        w.linestring = LineString::from(vec![(0.0, 0.0), (0.0, 1.0)]);
        let status = check_way(&w);
        assert!(status.has_status(StatusFlag::Orphan));
    }

    #[test]
    fn open_building_way_is_badgeom() {
        let mut tags = Tags::new();
        tags.insert("building".into(), "yes".into());
        let mut w = way(vec![1, 2, 3], tags);
        w.linestring = LineString::from(vec![(0.0, 0.0), (0.0, 1.0), (1.0, 1.0)]);
        let status = check_way(&w);
        assert!(status.has_status(StatusFlag::BadGeom));
    }

    #[test]
    fn node_with_no_tags_is_notags() {
        let node = OsmNode {
            id: 1,
            version: 1,
            changeset: 1,
            uid: 5,
            user: "a".into(),
            timestamp: NaiveDateTime::default(),
            point: Point::new(1.0, 2.0),
            tags: Tags::default(),
            action: Action::Create,
        };
        let status = check_node(&node);
        assert!(status.has_status(StatusFlag::NoTags));
        assert_eq!(status.center, Point::new(1.0, 2.0));
    }

    #[test]
    fn conflation_finding_folds_into_status() {
        let mut status = ValidateStatus::new(1, ObjType::Way, 1, 1, NaiveDateTime::default());
        status.mark_conflation(ConflationKind::Duplicate);
        assert!(status.has_status(StatusFlag::Duplicate));
    }
}
