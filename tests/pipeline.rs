//! End-to-end exercise of parse -> resolve -> stats over an in-memory
//! osmChange fixture. No network or database: way geometry is resolved
//! against a fake in-memory node store instead of `PostgresStore`.

use std::collections::HashMap;

use geo::Point;
use osmreplica::error::Result;
use osmreplica::model::OsmWay;
use osmreplica::nodecache::{self, NodeStore};
use osmreplica::osmchange;
use osmreplica::stats;

struct FixtureStore {
    points: HashMap<i64, Point<f64>>,
}

impl NodeStore for FixtureStore {
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

const CHANGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="test">
  <create>
    <node id="1" version="1" changeset="100" uid="7" user="alice" timestamp="2026-01-01T00:00:00Z" lat="45.0" lon="-75.0"/>
    <node id="2" version="1" changeset="100" uid="7" user="alice" timestamp="2026-01-01T00:00:00Z" lat="45.001" lon="-75.0"/>
    <node id="3" version="1" changeset="100" uid="7" user="alice" timestamp="2026-01-01T00:00:00Z" lat="45.001" lon="-75.001"/>
    <node id="42" version="1" changeset="101" uid="9" user="bob" timestamp="2026-01-01T00:01:00Z" lat="46.0" lon="-76.0">
      <tag k="shop" v="bakery"/>
    </node>
    <way id="10" version="1" changeset="100" uid="7" user="alice" timestamp="2026-01-01T00:00:00Z">
      <nd ref="1"/>
      <nd ref="2"/>
      <nd ref="3"/>
      <nd ref="1"/>
      <tag k="building" v="yes"/>
    </way>
  </create>
  <modify>
    <node id="2" version="2" changeset="102" uid="7" user="alice" timestamp="2026-01-01T00:05:00Z" lat="45.002" lon="-75.0"/>
  </modify>
  <delete>
    <node id="99" version="1" changeset="103" uid="7" user="alice" timestamp="2026-01-01T00:06:00Z" lat="0" lon="0"/>
  </delete>
</osmChange>
"#;

#[test]
fn parses_resolves_and_aggregates_a_small_change_file() {
    let mut file = osmchange::parse(CHANGE.as_bytes()).expect("valid osmChange document");
    assert_eq!(file.changes.len(), 3);

    let store = FixtureStore {
        points: [
            (1, Point::new(-75.0, 45.0)),
            (2, Point::new(-75.0, 45.001)),
            (3, Point::new(-75.001, 45.001)),
        ]
        .into_iter()
        .collect(),
    };
    nodecache::resolve(&mut file, &store, None).expect("resolves way geometry");

    let created = &file.changes[0];
    let building = created.ways.iter().find(|w| w.id == 10).expect("building way");
    assert!(building.is_polygon_eligible());
    assert_eq!(building.linestring.0.len(), 4);

    let userstats = stats::collect_stats(&file);
    assert_eq!(userstats[&7].pois_added, 3, "nodes 1, 2, and 3 are untagged POIs");
    assert_eq!(userstats[&7].buildings_added, 1);
    assert!(!userstats.contains_key(&9), "bob's tagged node is never counted as a POI");
}
