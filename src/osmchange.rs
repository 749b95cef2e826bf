//! OsmChange parser (spec §4.E) — a streaming `quick-xml` reader over an
//! `osmChange` document, transparently gzip-decoding when the body starts
//! with the gzip magic number (0x1f 0x8b), matching the way real planet
//! diff files are served.

use std::io::Read;

use chrono::NaiveDateTime;
use flate2::read::GzDecoder;
use geo::Point;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

use crate::error::{Error, Result};
use crate::model::{
    Action, ChangeAction, MemberType, OsmChange, OsmChangeFile, OsmNode, OsmRelation,
    OsmWay, RelationMember, Tags,
};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

fn maybe_decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if bytes.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        GzDecoder::new(bytes).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(bytes.to_vec())
    }
}

/// `2020-10-30T20:40:38Z` -> `2020-10-30 20:40:38`: drop the `T` separator
/// and the trailing `Z`/fractional seconds, the same substring surgery the
/// original parser does, expressed as a format-string round-trip instead
/// of manual indexing.
fn normalize_timestamp(raw: &str) -> Result<NaiveDateTime> {
    let mut chars: Vec<char> = raw.chars().collect();
    if chars.len() < 19 {
        return Err(Error::BadChange(format!("timestamp too short: {raw:?}")));
    }
    chars.truncate(19);
    if chars.get(10) == Some(&'T') {
        chars[10] = ' ';
    }
    let cleaned: String = chars.into_iter().collect();
    NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%d %H:%M:%S")
        .map_err(|e| Error::BadChange(format!("bad timestamp {raw:?}: {e}")))
}

#[derive(Default)]
struct Attrs {
    id: i64,
    version: u32,
    changeset: i64,
    uid: i64,
    user: String,
    timestamp: NaiveDateTime,
    lat: f64,
    lon: f64,
}

fn read_attrs(tag: &BytesStart) -> Result<Attrs> {
    let mut attrs = Attrs::default();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::BadChange(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| Error::BadChange(e.to_string()))?;
        match attr.key.as_ref() {
            b"id" => {
                attrs.id = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad id {value:?}: {e}")))?
            }
            b"version" => {
                attrs.version = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad version {value:?}: {e}")))?
            }
            b"changeset" => {
                attrs.changeset = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad changeset {value:?}: {e}")))?
            }
            b"uid" => {
                attrs.uid = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad uid {value:?}: {e}")))?
            }
            b"user" => attrs.user = value.into_owned(),
            b"timestamp" => attrs.timestamp = normalize_timestamp(&value)?,
            b"lat" => {
                attrs.lat = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad lat {value:?}: {e}")))?
            }
            b"lon" => {
                attrs.lon = value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad lon {value:?}: {e}")))?
            }
            _ => {}
        }
    }
    Ok(attrs)
}

fn tag_kv(tag: &BytesStart) -> Result<Option<(String, String)>> {
    let mut key = None;
    let mut value = None;
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::BadChange(e.to_string()))?;
        let v = attr
            .unescape_value()
            .map_err(|e| Error::BadChange(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"k" => key = Some(v),
            b"v" => value = Some(v),
            _ => {}
        }
    }
    Ok(key.zip(value))
}

fn nd_ref(tag: &BytesStart) -> Result<Option<i64>> {
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::BadChange(e.to_string()))?;
        if attr.key.as_ref() == b"ref" {
            let value = attr
                .unescape_value()
                .map_err(|e| Error::BadChange(e.to_string()))?;
            return Ok(Some(
                value
                    .parse()
                    .map_err(|e| Error::BadChange(format!("bad ref {value:?}: {e}")))?,
            ));
        }
    }
    Ok(None)
}

fn member_fields(tag: &BytesStart) -> Result<Option<RelationMember>> {
    let mut member_type = None;
    let mut member_ref = None;
    let mut role = String::new();
    for attr in tag.attributes() {
        let attr = attr.map_err(|e| Error::BadChange(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| Error::BadChange(e.to_string()))?;
        match attr.key.as_ref() {
            b"type" => {
                member_type = match value.as_ref() {
                    "node" => Some(MemberType::Node),
                    "way" => Some(MemberType::Way),
                    "relation" => Some(MemberType::Relation),
                    other => {
                        return Err(Error::BadChange(format!("unknown member type {other:?}")))
                    }
                }
            }
            b"ref" => {
                member_ref = Some(
                    value
                        .parse()
                        .map_err(|e| Error::BadChange(format!("bad member ref {value:?}: {e}")))?,
                )
            }
            b"role" => role = value.into_owned(),
            _ => {}
        }
    }
    Ok(member_type.zip(member_ref).map(|(member_type, member_ref)| RelationMember {
        member_type,
        member_ref,
        role,
    }))
}

enum Building {
    Node(OsmNode),
    Way(OsmWay),
    Relation(OsmRelation),
}

/// Parse a complete `osmChange` document, gzip or plain.
pub fn parse(bytes: &[u8]) -> Result<OsmChangeFile> {
    let bytes = maybe_decompress(bytes)?;
    let mut reader = Reader::from_reader(bytes.as_slice());
    reader.config_mut().trim_text_start = true;

    let mut file = OsmChangeFile::new();
    let mut current_action: Option<ChangeAction> = None;
    let mut building: Option<Building> = None;
    let mut buf = Vec::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::BadChange(e.to_string()))?
        {
            Event::Eof => break,
            Event::Start(tag) => {
                match tag.name().as_ref() {
                    b"create" => {
                        current_action = Some(ChangeAction::Create);
                        file.changes.push(OsmChange::new(ChangeAction::Create));
                    }
                    b"modify" => {
                        current_action = Some(ChangeAction::Modify);
                        file.changes.push(OsmChange::new(ChangeAction::Modify));
                    }
                    b"delete" => {
                        current_action = Some(ChangeAction::Remove);
                        file.changes.push(OsmChange::new(ChangeAction::Remove));
                    }
                    b"node" => {
                        let attrs = read_attrs(&tag)?;
                        let action = current_action
                            .ok_or_else(|| Error::BadChange("node outside create/modify/delete".into()))?;
                        let node = OsmNode {
                            id: attrs.id,
                            version: attrs.version,
                            changeset: attrs.changeset,
                            uid: attrs.uid,
                            user: attrs.user,
                            timestamp: attrs.timestamp,
                            point: Point::new(attrs.lon, attrs.lat),
                            tags: Tags::default(),
                            action: Action::from(action),
                        };
                        building = Some(Building::Node(node));
                    }
                    b"way" => {
                        let attrs = read_attrs(&tag)?;
                        let action = current_action
                            .ok_or_else(|| Error::BadChange("way outside create/modify/delete".into()))?;
                        let way = OsmWay::new(
                            attrs.id,
                            attrs.version,
                            attrs.changeset,
                            attrs.uid,
                            attrs.user,
                            attrs.timestamp,
                            Vec::new(),
                            Tags::default(),
                            Action::from(action),
                        );
                        building = Some(Building::Way(way));
                    }
                    b"relation" => {
                        let attrs = read_attrs(&tag)?;
                        let action = current_action.ok_or_else(|| {
                            Error::BadChange("relation outside create/modify/delete".into())
                        })?;
                        let relation = OsmRelation {
                            id: attrs.id,
                            version: attrs.version,
                            changeset: attrs.changeset,
                            uid: attrs.uid,
                            user: attrs.user,
                            timestamp: attrs.timestamp,
                            members: Vec::new(),
                            tags: Tags::default(),
                            action: Action::from(action),
                        };
                        building = Some(Building::Relation(relation));
                    }
                    b"tag" => {
                        if let Some((k, v)) = tag_kv(&tag)? {
                            match &mut building {
                                Some(Building::Node(n)) => {
                                    n.tags.insert(k, v);
                                }
                                Some(Building::Way(w)) => {
                                    w.tags.insert(k, v);
                                }
                                Some(Building::Relation(r)) => {
                                    r.tags.insert(k, v);
                                }
                                None => {}
                            }
                        }
                    }
                    b"nd" => {
                        if let Some(r) = nd_ref(&tag)? {
                            if let Some(Building::Way(w)) = &mut building {
                                w.refs.push(r);
                            }
                        }
                    }
                    b"member" => {
                        if let Some(member) = member_fields(&tag)? {
                            if let Some(Building::Relation(r)) = &mut building {
                                r.members.push(member);
                            }
                        }
                    }
                    _ => {}
                }
            }
            // Self-closing elements (`<node .../>`, `<nd ref="1"/>`) never
            // produce a matching `Event::End`, so entities with no child
            // tags must be built and finalized in one step here.
            Event::Empty(tag) => match tag.name().as_ref() {
                b"create" => file.changes.push(OsmChange::new(ChangeAction::Create)),
                b"modify" => file.changes.push(OsmChange::new(ChangeAction::Modify)),
                b"delete" => file.changes.push(OsmChange::new(ChangeAction::Remove)),
                b"node" => {
                    let attrs = read_attrs(&tag)?;
                    let action = current_action
                        .ok_or_else(|| Error::BadChange("node outside create/modify/delete".into()))?;
                    let node = OsmNode {
                        id: attrs.id,
                        version: attrs.version,
                        changeset: attrs.changeset,
                        uid: attrs.uid,
                        user: attrs.user,
                        timestamp: attrs.timestamp,
                        point: Point::new(attrs.lon, attrs.lat),
                        tags: Tags::default(),
                        action: Action::from(action),
                    };
                    if let Some(change) = file.changes.last_mut() {
                        change.nodes.push(node);
                    }
                }
                b"way" => {
                    let attrs = read_attrs(&tag)?;
                    let action = current_action
                        .ok_or_else(|| Error::BadChange("way outside create/modify/delete".into()))?;
                    let way = OsmWay::new(
                        attrs.id,
                        attrs.version,
                        attrs.changeset,
                        attrs.uid,
                        attrs.user,
                        attrs.timestamp,
                        Vec::new(),
                        Tags::default(),
                        Action::from(action),
                    );
                    if let Some(change) = file.changes.last_mut() {
                        change.ways.push(way);
                    }
                }
                b"relation" => {
                    let attrs = read_attrs(&tag)?;
                    let action = current_action.ok_or_else(|| {
                        Error::BadChange("relation outside create/modify/delete".into())
                    })?;
                    let relation = OsmRelation {
                        id: attrs.id,
                        version: attrs.version,
                        changeset: attrs.changeset,
                        uid: attrs.uid,
                        user: attrs.user,
                        timestamp: attrs.timestamp,
                        members: Vec::new(),
                        tags: Tags::default(),
                        action: Action::from(action),
                    };
                    if let Some(change) = file.changes.last_mut() {
                        change.relations.push(relation);
                    }
                }
                b"tag" => {
                    if let Some((k, v)) = tag_kv(&tag)? {
                        match &mut building {
                            Some(Building::Node(n)) => {
                                n.tags.insert(k, v);
                            }
                            Some(Building::Way(w)) => {
                                w.tags.insert(k, v);
                            }
                            Some(Building::Relation(r)) => {
                                r.tags.insert(k, v);
                            }
                            None => {}
                        }
                    }
                }
                b"nd" => {
                    if let Some(r) = nd_ref(&tag)? {
                        if let Some(Building::Way(w)) = &mut building {
                            w.refs.push(r);
                        }
                    }
                }
                b"member" => {
                    if let Some(member) = member_fields(&tag)? {
                        if let Some(Building::Relation(r)) = &mut building {
                            r.members.push(member);
                        }
                    }
                }
                _ => {}
            },
            Event::End(tag) => {
                match tag.name().as_ref() {
                    b"create" | b"modify" | b"delete" => {
                        current_action = None;
                    }
                    b"node" => {
                        if let Some(Building::Node(node)) = building.take() {
                            if let Some(change) = file.changes.last_mut() {
                                change.nodes.push(node);
                            }
                        }
                    }
                    b"way" => {
                        if let Some(Building::Way(way)) = building.take() {
                            if let Some(change) = file.changes.last_mut() {
                                change.ways.push(way);
                            }
                        }
                    }
                    b"relation" => {
                        if let Some(Building::Relation(relation)) = building.take() {
                            if let Some(change) = file.changes.last_mut() {
                                change.relations.push(relation);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<osmChange version="0.6" generator="test">
  <create>
    <node id="34567" version="1" timestamp="2020-10-30T20:15:24Z" uid="3333333" user="bar" changeset="93309184" lat="45.4303763" lon="10.9837526"/>
  </create>
  <modify>
    <way id="100" version="3" timestamp="2020-10-30T20:40:38Z" uid="111111" user="foo" changeset="93310152">
      <nd ref="1"/>
      <nd ref="2"/>
      <nd ref="3"/>
      <nd ref="1"/>
      <tag k="building" v="yes"/>
    </way>
  </modify>
  <delete>
    <node id="99" version="2" timestamp="2020-10-30T20:40:38Z" uid="111111" user="foo" changeset="93310152" lat="0" lon="0"/>
  </delete>
</osmChange>
"#;

    #[test]
    fn parses_create_modify_delete_blocks() {
        let file = parse(SIMPLE.as_bytes()).unwrap();
        assert_eq!(file.changes.len(), 3);
        assert_eq!(file.changes[0].action, ChangeAction::Create);
        assert_eq!(file.changes[0].nodes.len(), 1);
        assert_eq!(file.changes[0].nodes[0].id, 34567);
        assert_eq!(file.changes[0].nodes[0].lon(), 10.9837526);

        assert_eq!(file.changes[1].action, ChangeAction::Modify);
        let way = &file.changes[1].ways[0];
        assert_eq!(way.refs, vec![1, 2, 3, 1]);
        assert_eq!(way.tag("building"), Some("yes"));
        assert!(way.is_closed());

        assert_eq!(file.changes[2].action, ChangeAction::Remove);
        assert_eq!(file.changes[2].nodes[0].id, 99);
    }

    #[test]
    fn normalizes_timestamp_by_dropping_t_and_z() {
        let ts = normalize_timestamp("2020-10-30T20:40:38Z").unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2020-10-30 20:40:38");
    }

    #[test]
    fn decompresses_gzip_payloads() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(SIMPLE.as_bytes()).unwrap();
        let gzipped = enc.finish().unwrap();

        let file = parse(&gzipped).unwrap();
        assert_eq!(file.changes.len(), 3);
    }
}
