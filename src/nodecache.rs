//! Node cache + resolver (spec §4.G) — fills in way geometry after an
//! osmChange document has been parsed. Ways only carry node ids; this
//! module turns those ids into coordinates (fetched from the store) and
//! the coordinates into `geo` linestrings/polygons.

use std::collections::HashMap;

use geo::{Contains, LineString, MultiPolygon, Point, Polygon};

use crate::error::Result;
use crate::model::{Action, ChangeAction, OsmChange, OsmChangeFile, OsmWay};

/// The subset of the raw store the resolver needs: node coordinate lookup
/// and "which ways reference any of these nodes", both keyed the same way
/// the original `getNodeCache`/`getWaysByNodesRefs` pair are.
pub trait NodeStore {
    fn fetch_points(&self, ids: &[i64]) -> Result<HashMap<i64, Point<f64>>>;
    fn ways_referencing(&self, node_ids: &[i64]) -> Result<Vec<OsmWay>>;
}

/// Load the `--boundary` GeoJSON file into a `geo` multipolygon used to
/// restrict which modified nodes trigger a synthetic way re-derivation.
pub fn load_boundary(geojson_text: &str) -> Result<MultiPolygon<f64>> {
    let parsed = geojson_text
        .parse::<geojson::GeoJson>()
        .map_err(|e| crate::error::Error::Fatal(format!("bad boundary GeoJSON: {e}")))?;
    let geometry = match parsed {
        geojson::GeoJson::Geometry(g) => g,
        geojson::GeoJson::Feature(f) => f
            .geometry
            .ok_or_else(|| crate::error::Error::Fatal("boundary feature has no geometry".into()))?,
        geojson::GeoJson::FeatureCollection(fc) => fc
            .features
            .into_iter()
            .find_map(|f| f.geometry)
            .ok_or_else(|| crate::error::Error::Fatal("boundary collection has no geometry".into()))?,
    };
    let geo_value: geo::Geometry<f64> = geometry
        .try_into()
        .map_err(|e: geojson::Error| crate::error::Error::Fatal(format!("bad boundary geometry: {e}")))?;
    match geo_value {
        geo::Geometry::MultiPolygon(mp) => Ok(mp),
        geo::Geometry::Polygon(p) => Ok(MultiPolygon::new(vec![p])),
        other => Err(crate::error::Error::Fatal(format!(
            "boundary must be a Polygon or MultiPolygon, got {other:?}"
        ))),
    }
}

/// Resolve every way's geometry in `file`, fetching whatever node
/// coordinates aren't already cached from `store`. Ways whose nodes are
/// unresolvable (deleted out from under a stale reference) simply get a
/// shorter linestring — spec §4.G's "skip, don't fail" policy.
pub fn resolve(file: &mut OsmChangeFile, store: &dyn NodeStore, boundary: Option<&MultiPolygon<f64>>) -> Result<()> {
    let mut referenced: Vec<i64> = Vec::new();
    let mut removed_ways: Vec<i64> = Vec::new();
    let mut modified_node_ids: Vec<i64> = Vec::new();

    for change in &file.changes {
        for way in &change.ways {
            if way.action == Action::Remove {
                removed_ways.push(way.id);
                continue;
            }
            for r in &way.refs {
                if !file.nodecache.contains_key(r) {
                    referenced.push(*r);
                }
            }
        }
        for node in &change.nodes {
            if node.action == Action::Modify {
                let inside = match boundary {
                    Some(b) => b.contains(&node.point),
                    None => true,
                };
                if inside {
                    modified_node_ids.push(node.id);
                }
            }
        }
    }

    if !modified_node_ids.is_empty() {
        let modified_ways = store.ways_referencing(&modified_node_ids)?;
        let mut synthetic = OsmChange::new(ChangeAction::Modify);
        for mut way in modified_ways {
            for r in &way.refs {
                if !file.nodecache.contains_key(r) {
                    referenced.push(*r);
                }
            }
            if !removed_ways.contains(&way.id) {
                way.action = Action::Modify;
                synthetic.ways.push(way);
            }
        }
        if !synthetic.ways.is_empty() {
            file.changes.push(synthetic);
        }
    }

    if !referenced.is_empty() {
        referenced.sort_unstable();
        referenced.dedup();
        let points = store.fetch_points(&referenced)?;
        file.nodecache.extend(points);
    }

    for change in &mut file.changes {
        for way in &mut change.ways {
            rebuild_geometry(way, &file.nodecache);
        }
    }

    Ok(())
}

fn rebuild_geometry(way: &mut OsmWay, nodecache: &HashMap<i64, Point<f64>>) {
    let coords: Vec<Point<f64>> = way
        .refs
        .iter()
        .filter_map(|r| nodecache.get(r).copied())
        .collect();
    way.linestring = LineString::from(coords);
    way.polygon = if way.is_closed() && way.linestring.0.len() >= 4 {
        Some(Polygon::new(way.linestring.clone(), Vec::new()))
    } else {
        None
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeAction, OsmChange, Tags};
    use chrono::NaiveDateTime;

    struct FakeStore {
        points: HashMap<i64, Point<f64>>,
    }

    impl NodeStore for FakeStore {
        fn fetch_points(&self, ids: &[i64]) -> Result<HashMap<i64, Point<f64>>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.points.get(id).map(|p| (*id, *p)))
                .collect())
        }

        fn ways_referencing(&self, _node_ids: &[i64]) -> Result<Vec<OsmWay>> {
            Ok(Vec::new())
        }
    }

    fn way(id: i64, refs: Vec<i64>) -> OsmWay {
        OsmWay::new(id, 1, 1, 1, "a".into(), NaiveDateTime::default(), refs, Tags::default(), Action::Modify)
    }

    #[test]
    fn resolves_linestring_from_store_when_not_cached() {
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Modify);
        change.ways.push(way(1, vec![1, 2, 3, 1]));
        file.changes.push(change);

        let store = FakeStore {
            points: [
                (1, Point::new(0.0, 0.0)),
                (2, Point::new(0.0, 1.0)),
                (3, Point::new(1.0, 1.0)),
            ]
            .into_iter()
            .collect(),
        };

        resolve(&mut file, &store, None).unwrap();
        let way = &file.changes[0].ways[0];
        assert_eq!(way.linestring.0.len(), 4);
        assert!(way.polygon.is_some());
    }

    #[test]
    fn missing_refs_are_skipped_not_fatal() {
        let mut file = OsmChangeFile::new();
        let mut change = OsmChange::new(ChangeAction::Modify);
        change.ways.push(way(1, vec![1, 2, 999]));
        file.changes.push(change);

        let store = FakeStore {
            points: [(1, Point::new(0.0, 0.0)), (2, Point::new(0.0, 1.0))]
                .into_iter()
                .collect(),
        };

        resolve(&mut file, &store, None).unwrap();
        assert_eq!(file.changes[0].ways[0].linestring.0.len(), 2);
    }
}
