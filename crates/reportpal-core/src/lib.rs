//! Document tree model and entity contracts for the Report Pal feed integration.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

pub const CRATE_NAME: &str = "reportpal-core";

pub const DEFAULT_FEED_URL: &str = "https://reportpal-cdn.resorts-interactive.com/mtnxml/162";
pub const DEFAULT_UPDATE_INTERVAL_MINUTES: u64 = 15;
pub const MIN_UPDATE_INTERVAL_MINUTES: u64 = 1;
pub const MAX_UPDATE_INTERVAL_MINUTES: u64 = 60;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const ATTRIBUTION: &str = "Data provided by the resort's Report Pal feed";

/// One node of a parsed feed document.
///
/// The tree mirrors the structural ambiguity of the source format: element
/// attributes live under `"@name"` keys, mixed text under `"#text"`, and a
/// repeated child element appears as a [`XmlValue::List`] while a lone one
/// appears as a [`XmlValue::Map`]. Cardinality at fetch time decides which,
/// so consumers of repeated groups must go through [`as_sequence`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum XmlValue {
    Text(String),
    Map(BTreeMap<String, XmlValue>),
    List(Vec<XmlValue>),
}

impl XmlValue {
    /// Child or attribute entry by exact key (`"lifts"`, `"@name"`, ...).
    pub fn get(&self, key: &str) -> Option<&XmlValue> {
        match self {
            XmlValue::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Descend through a fixed chain of keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&XmlValue> {
        let mut node = self;
        for key in path {
            node = node.get(key)?;
        }
        Some(node)
    }

    /// Attribute value by name, without the `@` prefix.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.get(&format!("@{name}")).and_then(XmlValue::text)
    }

    /// Text content: the node itself for a leaf, `"#text"` for a mixed node.
    pub fn text(&self) -> Option<&str> {
        match self {
            XmlValue::Text(text) => Some(text),
            XmlValue::Map(map) => match map.get("#text") {
                Some(XmlValue::Text(text)) => Some(text),
                _ => None,
            },
            XmlValue::List(_) => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, XmlValue>> {
        match self {
            XmlValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[XmlValue]> {
        match self {
            XmlValue::List(items) => Some(items),
            _ => None,
        }
    }
}

/// Normalize the one-or-many representation of a repeated element group.
///
/// An absent key yields an empty sequence, a lone node a one-element
/// sequence, and a list its items in order. Never fails.
pub fn as_sequence(node: Option<&XmlValue>) -> Vec<&XmlValue> {
    match node {
        None => Vec::new(),
        Some(XmlValue::List(items)) => items.iter().collect(),
        Some(single) => vec![single],
    }
}

/// Primary value of one observable entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EntityValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl From<bool> for EntityValue {
    fn from(value: bool) -> Self {
        EntityValue::Bool(value)
    }
}

impl From<f64> for EntityValue {
    fn from(value: f64) -> Self {
        EntityValue::Number(value)
    }
}

impl From<String> for EntityValue {
    fn from(value: String) -> Self {
        EntityValue::Text(value)
    }
}

/// Supplementary attribute bundle attached to an entity value.
pub type AttrMap = serde_json::Map<String, serde_json::Value>;

/// Primary value plus attribute bundle, as read from the current document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub value: EntityValue,
    pub attributes: AttrMap,
}

impl EntityState {
    pub fn new(value: impl Into<EntityValue>, attributes: AttrMap) -> Self {
        Self {
            value: value.into(),
            attributes,
        }
    }

    /// The closed/unknown fallback: `false` with no attributes.
    pub fn closed() -> Self {
        Self {
            value: EntityValue::Bool(false),
            attributes: AttrMap::new(),
        }
    }
}

/// Host-platform device classification hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Running,
    Distance,
    Temperature,
}

/// Which extraction family serves an entity, with the lookup keys it needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKind {
    ResortStatus,
    Lift { area: String, name: String },
    Trail { area: String, name: String },
    TerrainParks,
    TrailsByDifficulty,
    Tram,
    Snowmaking,
    SnowDepth,
    Snowfall24h,
    CurrentWeather,
    Parking,
    Shuttle,
}

/// Registration contract handed to the host platform for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityDescriptor {
    pub unique_id: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: EntityKind,
    pub device_class: Option<DeviceClass>,
    pub icon: Option<String>,
    pub unit: Option<String>,
}

/// Lower-case a display name and replace spaces with underscores.
pub fn slugify(name: &str) -> String {
    name.to_lowercase().replace(' ', "_")
}

/// Unique id for a per-lift entity.
///
/// Derived from the lift name only; two areas each holding a lift with the
/// same name collide. The area is carried in the attribute bundle instead of
/// the id so that ids stay stable for already-registered entities.
pub fn lift_unique_id(lift_name: &str) -> String {
    format!("reportpal_lift_{}", slugify(lift_name))
}

/// Unique id for a per-trail entity. Same collision caveat as lifts.
pub fn trail_unique_id(trail_name: &str) -> String {
    format!("reportpal_trail_{}", slugify(trail_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(text: &str) -> XmlValue {
        XmlValue::Text(text.to_string())
    }

    fn map(entries: &[(&str, XmlValue)]) -> XmlValue {
        XmlValue::Map(
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn as_sequence_of_absent_key_is_empty() {
        assert!(as_sequence(None).is_empty());
    }

    #[test]
    fn as_sequence_wraps_a_lone_mapping() {
        let lone = map(&[("@name", leaf("Lift1"))]);
        let seq = as_sequence(Some(&lone));
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0], &lone);
    }

    #[test]
    fn as_sequence_is_idempotent_on_lists() {
        let list = XmlValue::List(vec![leaf("a"), leaf("b")]);
        let once = as_sequence(Some(&list));
        assert_eq!(once.len(), 2);
        // Re-normalizing each element changes nothing.
        for (item, expected) in once.iter().copied().zip(["a", "b"]) {
            let again = as_sequence(Some(item));
            assert_eq!(again.len(), 1);
            assert_eq!(again[0].text(), Some(expected));
        }
    }

    #[test]
    fn attr_and_text_accessors() {
        let node = map(&[
            ("@status", leaf("Open")),
            ("#text", leaf("Powder day.")),
            ("child", leaf("x")),
        ]);
        assert_eq!(node.attr("status"), Some("Open"));
        assert_eq!(node.attr("missing"), None);
        assert_eq!(node.text(), Some("Powder day."));
        assert_eq!(node.get("child").and_then(XmlValue::text), Some("x"));
        assert_eq!(leaf("plain").text(), Some("plain"));
    }

    #[test]
    fn get_path_walks_nested_maps() {
        let doc = map(&[(
            "report",
            map(&[("operations", map(&[("@resortStatus", leaf("Open"))]))]),
        )]);
        let status = doc
            .get_path(&["report", "operations"])
            .and_then(|ops| ops.attr("resortStatus"));
        assert_eq!(status, Some("Open"));
        assert!(doc.get_path(&["report", "missing", "deeper"]).is_none());
    }

    #[test]
    fn unique_ids_slugify_names() {
        assert_eq!(slugify("Lone Peak Tram"), "lone_peak_tram");
        assert_eq!(lift_unique_id("Ramcharger 8"), "reportpal_lift_ramcharger_8");
        assert_eq!(trail_unique_id("Big Couloir"), "reportpal_trail_big_couloir");
    }
}
