//! Stats aggregator (spec §4.I) — a pure pass over a parsed, resolved
//! `OsmChangeFile` that produces per-user counters. Only `create` and
//! `modify` blocks contribute; a `delete` block has nothing to count
//! (spec §4.I/§9: no "removed" counters are defined).

use std::collections::HashMap;

use log::warn;

use crate::model::{ChangeAction, ChangeStats, OsmChangeFile, OsmNode, OsmWay};

/// A way with no tags at all never contributes a counter; if it also
/// happens to be a closed pentagon (4 distinct corners back to start) it's
/// flagged as a likely building missing its tags, matching the original
/// heuristic.
fn warn_if_building_shaped(way: &OsmWay) {
    if way.is_closed() && way.num_points() == 5 {
        warn!("way {} looks like an untagged building", way.id);
    }
}

trait HasTagsLogged {
    fn has_tags_logged(&self) -> bool;
}

impl HasTagsLogged for OsmNode {
    fn has_tags_logged(&self) -> bool {
        if !self.tags.is_empty() {
            warn!("node {} carries tags, not counted as a bare POI", self.id);
            true
        } else {
            false
        }
    }
}

/// Walk every change in `file`, returning per-user counters keyed by uid.
pub fn collect_stats(file: &OsmChangeFile) -> HashMap<i64, ChangeStats> {
    let mut userstats: HashMap<i64, ChangeStats> = HashMap::new();

    for change in &file.changes {
        match change.action {
            ChangeAction::Create => {
                for node in &change.nodes {
                    if node.has_tags_logged() {
                        continue;
                    }
                    userstats.entry(node.uid).or_default().pois_added += 1;
                }
                for way in &change.ways {
                    if !way.has_tags() {
                        warn!("way {} created with no tags", way.id);
                        warn_if_building_shaped(way);
                        continue;
                    }
                    let entry = userstats.entry(way.uid).or_default();
                    if way.tag("building").is_some() {
                        entry.buildings_added += 1;
                    }
                    if way.tag("highway").is_some() {
                        entry.roads_added += 1;
                        entry.roads_km_added += way.length_km();
                    }
                    if way.tag("waterway").is_some() {
                        entry.waterways_added += 1;
                        entry.waterways_km_added += way.length_km();
                    }
                }
            }
            ChangeAction::Modify => {
                for node in &change.nodes {
                    if node.has_tags_logged() {
                        continue;
                    }
                    userstats.entry(node.uid).or_default().pois_modified += 1;
                }
                for way in &change.ways {
                    if !way.has_tags() {
                        warn!("way {} modified with no tags", way.id);
                        continue;
                    }
                    let entry = userstats.entry(way.uid).or_default();
                    if way.tag("building").is_some() {
                        entry.buildings_modified += 1;
                    }
                    if way.tag("highway").is_some() {
                        entry.roads_modified += 1;
                        entry.roads_km_modified += way.length_km();
                    }
                    if way.tag("waterway").is_some() {
                        entry.waterways_modified += 1;
                        entry.waterways_km_modified += way.length_km();
                    }
                }
            }
            ChangeAction::Remove => {}
        }
    }

    userstats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Action, OsmChange, Tags};
    use chrono::NaiveDateTime;
    use geo::{LineString, Point};

    fn node(uid: i64, tags: Tags) -> OsmNode {
        OsmNode {
            id: 1,
            version: 1,
            changeset: 1,
            uid,
            user: "a".into(),
            timestamp: NaiveDateTime::default(),
            point: Point::new(0.0, 0.0),
            tags,
            action: Action::Create,
        }
    }

    fn building_way(uid: i64) -> OsmWay {
        let mut tags = Tags::new();
        tags.insert("building".into(), "yes".into());
        let mut way = OsmWay::new(10, 1, 1, uid, "a".into(), NaiveDateTime::default(), vec![1, 2, 3, 1], tags, Action::Create);
        way.linestring = LineString::from(vec![(0.0, 0.0), (0.0, 0.001), (0.001, 0.001), (0.0, 0.0)]);
        way
    }

    #[test]
    fn untagged_created_node_counts_as_poi() {
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Create);
        change.nodes.push(node(42, Tags::default()));
        file.changes.push(change);

        let stats = collect_stats(&file);
        assert_eq!(stats[&42].pois_added, 1);
    }

    #[test]
    fn tagged_created_node_is_not_counted() {
        let mut tags = Tags::new();
        tags.insert("shop".into(), "bakery".into());
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Create);
        change.nodes.push(node(7, tags));
        file.changes.push(change);

        let stats = collect_stats(&file);
        assert!(!stats.contains_key(&7));
    }

    #[test]
    fn building_way_created_counts_once_per_tag() {
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Create);
        change.ways.push(building_way(5));
        file.changes.push(change);

        let stats = collect_stats(&file);
        assert_eq!(stats[&5].buildings_added, 1);
        assert_eq!(stats[&5].roads_added, 0);
    }

    #[test]
    fn highway_way_accumulates_length() {
        let mut tags = Tags::new();
        tags.insert("highway".into(), "residential".into());
        let mut way = OsmWay::new(11, 1, 1, 9, "a".into(), NaiveDateTime::default(), vec![1, 2], tags, Action::Modify);
        way.linestring = LineString::from(vec![(0.0, 0.0), (0.0, 0.01)]);

        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Modify);
        change.ways.push(way);
        file.changes.push(change);

        let stats = collect_stats(&file);
        assert_eq!(stats[&9].roads_modified, 1);
        assert!(stats[&9].roads_km_modified > 0.0);
    }

    #[test]
    fn untagged_way_never_creates_a_userstats_entry() {
        let way = OsmWay::new(12, 1, 1, 3, "a".into(), NaiveDateTime::default(), vec![1, 2, 3, 1], Tags::default(), Action::Create);
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Create);
        change.ways.push(way);
        file.changes.push(change);

        let stats = collect_stats(&file);
        assert!(!stats.contains_key(&3));
    }
}
