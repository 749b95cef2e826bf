//! Raw-store writer (spec §4.H) — the only module that issues
//! `INSERT`/`UPDATE`/`DELETE` against `nodes`/`ways_poly`/`ways_line`/
//! `way_refs`. Every write is guarded by the entity's version, so a
//! replayed or out-of-order update can never clobber a newer one.

use std::collections::HashMap;

use chrono::NaiveDateTime;
use geo::Point;
use postgres::types::Json;

use crate::catalog::PgPool;
use crate::error::Result;
use crate::model::{Action, OsmNode, OsmWay, Tags};
use crate::nodecache::NodeStore;

const POLY_TABLE: &str = "ways_poly";
const LINE_TABLE: &str = "ways_line";

pub struct PostgresStore {
    pool: PgPool,
}

fn point_wkt(point: Point<f64>) -> String {
    format!("POINT({:.12} {:.12})", point.x(), point.y())
}

fn linestring_wkt(way: &OsmWay) -> String {
    let coords: Vec<String> = way
        .linestring
        .points()
        .map(|p| format!("{:.12} {:.12}", p.x(), p.y()))
        .collect();
    format!("LINESTRING({})", coords.join(", "))
}

fn polygon_wkt(way: &OsmWay) -> String {
    let coords: Vec<String> = way
        .linestring
        .points()
        .map(|p| format!("{:.12} {:.12}", p.x(), p.y()))
        .collect();
    format!("POLYGON(({}))", coords.join(", "))
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Node upsert uses a strict version guard (spec §3 invariant): a
    /// same-version replay is dropped silently, not reapplied.
    pub fn upsert_node(&self, node: &OsmNode) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let wkt = point_wkt(node.point);
        let applied = conn.execute(
            "INSERT INTO nodes (osm_id, geom, tags, timestamp, version, \"user\", uid, changeset) \
             VALUES ($1, ST_GeomFromText($2, 4326), $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (osm_id) DO UPDATE SET \
               geom = EXCLUDED.geom, tags = EXCLUDED.tags, timestamp = EXCLUDED.timestamp, \
               version = EXCLUDED.version, \"user\" = EXCLUDED.\"user\", uid = EXCLUDED.uid, \
               changeset = EXCLUDED.changeset \
             WHERE nodes.version < EXCLUDED.version",
            &[
                &node.id,
                &wkt,
                &Json(&node.tags),
                &node.timestamp,
                &(node.version as i32),
                &node.user,
                &node.uid,
                &node.changeset,
            ],
        )?;
        Ok(applied > 0)
    }

    pub fn delete_node(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get()?;
        conn.execute("DELETE FROM nodes WHERE osm_id = $1", &[&id])?;
        Ok(())
    }

    /// Way upsert uses an inclusive version guard (spec §3 invariant): a
    /// same-version replay reapplies harmlessly, since the write is a
    /// pure function of the entity's own fields. `way_refs` is fully
    /// replaced inside the same transaction so a reader never observes a
    /// half-updated ref set.
    pub fn upsert_way(&self, way: &OsmWay) -> Result<bool> {
        let table = if way.is_polygon_eligible() { POLY_TABLE } else { LINE_TABLE };
        let other_table = if table == POLY_TABLE { LINE_TABLE } else { POLY_TABLE };
        let geom_wkt = if table == POLY_TABLE {
            polygon_wkt(way)
        } else {
            linestring_wkt(way)
        };

        let mut conn = self.pool.get()?;
        let mut txn = conn.transaction()?;

        // A way can flip between open and closed across versions (a ref
        // added/removed moves it between tables); drop any stale row left
        // behind in the table it no longer belongs to.
        txn.execute(
            &format!("DELETE FROM {other_table} WHERE osm_id = $1 AND version < $2"),
            &[&way.id, &(way.version as i32)],
        )?;

        let sql = format!(
            "INSERT INTO {table} (osm_id, tags, geom, timestamp, version, \"user\", uid, changeset) \
             VALUES ($1, $2, ST_GeomFromText($3, 4326), $4, $5, $6, $7, $8) \
             ON CONFLICT (osm_id) DO UPDATE SET \
               tags = EXCLUDED.tags, geom = EXCLUDED.geom, timestamp = EXCLUDED.timestamp, \
               version = EXCLUDED.version, \"user\" = EXCLUDED.\"user\", uid = EXCLUDED.uid, \
               changeset = EXCLUDED.changeset \
             WHERE {table}.version <= EXCLUDED.version"
        );
        let applied = txn.execute(
            &sql,
            &[
                &way.id,
                &Json(&way.tags),
                &geom_wkt,
                &way.timestamp,
                &(way.version as i32),
                &way.user,
                &way.uid,
                &way.changeset,
            ],
        )?;

        if applied > 0 {
            txn.execute("DELETE FROM way_refs WHERE way_id = $1", &[&way.id])?;
            for (position, node_id) in way.refs.iter().enumerate() {
                txn.execute(
                    "INSERT INTO way_refs (way_id, node_id, position) VALUES ($1, $2, $3)",
                    &[&way.id, node_id, &(position as i32)],
                )?;
            }
        }

        txn.commit()?;
        Ok(applied > 0)
    }

    pub fn delete_way(&self, id: i64) -> Result<()> {
        let mut conn = self.pool.get()?;
        let mut txn = conn.transaction()?;
        txn.execute("DELETE FROM way_refs WHERE way_id = $1", &[&id])?;
        txn.execute(&format!("DELETE FROM {POLY_TABLE} WHERE osm_id = $1"), &[&id])?;
        txn.execute(&format!("DELETE FROM {LINE_TABLE} WHERE osm_id = $1"), &[&id])?;
        txn.commit()?;
        Ok(())
    }
}

impl NodeStore for PostgresStore {
    fn fetch_points(&self, ids: &[i64]) -> Result<HashMap<i64, Point<f64>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.pool.get()?;
        let rows = conn.query(
            "SELECT osm_id, ST_X(geom) AS lon, ST_Y(geom) AS lat FROM nodes WHERE osm_id = ANY($1)",
            &[&ids],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("osm_id");
                let lon: f64 = row.get("lon");
                let lat: f64 = row.get("lat");
                (id, Point::new(lon, lat))
            })
            .collect())
    }

    fn ways_referencing(&self, node_ids: &[i64]) -> Result<Vec<OsmWay>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get()?;
        let rows = conn.query(
            "SELECT DISTINCT wr.way_id, w.version, w.tags, \
                    array_agg(wr.node_id ORDER BY wr.position) AS refs \
             FROM way_refs wr \
             JOIN ways_poly w ON w.osm_id = wr.way_id \
             WHERE wr.node_id = ANY($1) \
             GROUP BY wr.way_id, w.version, w.tags \
             UNION \
             SELECT DISTINCT wr.way_id, w.version, w.tags, \
                    array_agg(wr.node_id ORDER BY wr.position) AS refs \
             FROM way_refs wr \
             JOIN ways_line w ON w.osm_id = wr.way_id \
             WHERE wr.node_id = ANY($1) \
             GROUP BY wr.way_id, w.version, w.tags",
            &[&node_ids],
        )?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let id: i64 = row.get("way_id");
                let version: i32 = row.get("version");
                let Json(tags): Json<Tags> = row.get("tags");
                let refs: Vec<i64> = row.get("refs");
                OsmWay::new(
                    id,
                    version as u32,
                    0,
                    0,
                    String::new(),
                    NaiveDateTime::default(),
                    refs,
                    tags,
                    Action::None,
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OsmWay;
    use chrono::NaiveDateTime;

    fn way_with_ring() -> OsmWay {
        let mut way = OsmWay::new(
            1,
            1,
            1,
            1,
            "a".into(),
            NaiveDateTime::default(),
            vec![1, 2, 3, 1],
            Tags::default(),
            Action::Modify,
        );
        way.linestring = geo::LineString::from(vec![
            (0.0, 0.0),
            (0.0, 1.0),
            (1.0, 1.0),
            (0.0, 0.0),
        ]);
        way
    }

    #[test]
    fn polygon_eligible_ways_get_closed_ring_wkt() {
        let way = way_with_ring();
        assert!(way.is_polygon_eligible());
        let wkt = polygon_wkt(&way);
        assert!(wkt.starts_with("POLYGON((0.000000000000 0.000000000000"));
        assert!(wkt.ends_with("0.000000000000 0.000000000000))"));
    }

    #[test]
    fn linestring_wkt_uses_lon_lat_order() {
        let way = way_with_ring();
        let wkt = linestring_wkt(&way);
        assert!(wkt.starts_with("LINESTRING(0.000000000000 0.000000000000,"));
    }
}
