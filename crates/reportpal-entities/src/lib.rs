//! The Resort Document Projector: pure, stateless extraction functions that
//! map one parsed feed document into entity values and attribute bundles.
//!
//! Every function takes the current document explicitly; nothing here reaches
//! into ambient state, caches, or the refresh machinery. A fresh document
//! simply produces fresh reads.

use std::collections::BTreeMap;

use reportpal_core::{
    as_sequence, lift_unique_id, slugify, trail_unique_id, AttrMap, DeviceClass, EntityDescriptor,
    EntityKind, EntityState, XmlValue,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "reportpal-entities";

/// The area whose single lift entry is the aerial tram.
pub const TRAM_AREA: &str = "Lone Peak Area";

/// Canonical fallback for condition strings outside the known vocabulary.
pub const CONDITION_EXCEPTIONAL: &str = "exceptional";

/// The five difficulty buckets tallied by [`trails_by_difficulty`].
pub const DIFFICULTY_BUCKETS: [&str; 5] = [
    "beginner",
    "intermediate",
    "advanced",
    "expert",
    "high_exposure",
];

/// Per-entity read failures. Absence of a named lift/trail/park/area is not
/// an error (it reads as closed/unknown); these fire only when a required
/// top-level field is gone or a numeric field refuses to parse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectError {
    #[error("feed document is missing required field {pointer}")]
    MissingField { pointer: &'static str },
    #[error("feed field {pointer} has non-numeric value {value:?}")]
    Conversion {
        pointer: &'static str,
        value: String,
    },
}

fn areas(doc: &XmlValue) -> Vec<&XmlValue> {
    as_sequence(doc.get_path(&["report", "facilities", "areas", "area"]))
}

fn find_area<'a>(doc: &'a XmlValue, area_name: &str) -> Option<&'a XmlValue> {
    areas(doc)
        .into_iter()
        .find(|area| area.attr("name") == Some(area_name))
}

fn named_child<'a>(
    doc: &'a XmlValue,
    area_name: &str,
    group: &str,
    element: &str,
    name: &str,
) -> Option<&'a XmlValue> {
    let area = find_area(doc, area_name)?;
    let collection = area.get(group).and_then(|g| g.get(element));
    as_sequence(collection)
        .into_iter()
        .find(|node| node.attr("name") == Some(name))
}

fn status_is_open(node: &XmlValue) -> bool {
    node.attr("status")
        .is_some_and(|status| status.eq_ignore_ascii_case("open"))
}

fn attr_or<'a>(node: &'a XmlValue, name: &str, default: &'a str) -> &'a str {
    node.attr(name).unwrap_or(default)
}

fn resortwide_attr<'a>(
    doc: &'a XmlValue,
    name: &str,
    pointer: &'static str,
) -> Result<&'a str, ProjectError> {
    doc.get_path(&["report", "currentConditions", "resortwide"])
        .and_then(|node| node.attr(name))
        .ok_or(ProjectError::MissingField { pointer })
}

/// Resort-level open/closed state from the operations block.
///
/// A document without the operations block or its status attribute is
/// malformed; that failure is the caller's to surface, and only for this
/// entity.
pub fn resort_status(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    let operations = doc
        .get_path(&["report", "operations"])
        .ok_or(ProjectError::MissingField {
            pointer: "report/operations",
        })?;
    let status = operations
        .attr("resortStatus")
        .ok_or(ProjectError::MissingField {
            pointer: "report/operations/@resortStatus",
        })?;
    let mut attributes = AttrMap::new();
    attributes.insert("open_time".into(), json!(attr_or(operations, "openTime", "")));
    attributes.insert("close_time".into(), json!(attr_or(operations, "closeTime", "")));
    Ok(EntityState::new(status.eq_ignore_ascii_case("open"), attributes))
}

/// Open state plus detail attributes for one lift, looked up by area and
/// name. An unknown area or lift reads as closed with no attributes.
pub fn lift_status(doc: &XmlValue, area_name: &str, lift_name: &str) -> EntityState {
    let Some(lift) = named_child(doc, area_name, "lifts", "lift", lift_name) else {
        debug!(area = area_name, lift = lift_name, "lift not in current document");
        return EntityState::closed();
    };
    let mut attributes = AttrMap::new();
    attributes.insert("type".into(), json!(attr_or(lift, "type", "")));
    attributes.insert("capacity".into(), json!(attr_or(lift, "capacity", "")));
    attributes.insert("area".into(), json!(area_name));
    attributes.insert("open_time".into(), json!(attr_or(lift, "openTime", "")));
    attributes.insert("close_time".into(), json!(attr_or(lift, "closeTime", "")));
    attributes.insert(
        "status_detail".into(),
        json!(attr_or(lift, "statusDetail", "")),
    );
    EntityState::new(status_is_open(lift), attributes)
}

/// Open state plus detail attributes for one trail. Same lookup policy as
/// [`lift_status`].
pub fn trail_status(doc: &XmlValue, area_name: &str, trail_name: &str) -> EntityState {
    let Some(trail) = named_child(doc, area_name, "trails", "trail", trail_name) else {
        debug!(area = area_name, trail = trail_name, "trail not in current document");
        return EntityState::closed();
    };
    let mut attributes = AttrMap::new();
    attributes.insert("difficulty".into(), json!(attr_or(trail, "difficulty", "")));
    attributes.insert("area".into(), json!(area_name));
    attributes.insert("groomed".into(), json!(attr_or(trail, "groomed", "no")));
    attributes.insert("uphill".into(), json!(attr_or(trail, "uphill", "no")));
    EntityState::new(status_is_open(trail), attributes)
}

/// Icon hint for a lift, decided by type substring; first match wins.
pub fn lift_icon(lift_type: &str) -> &'static str {
    if lift_type.contains("Tram") {
        "mdi:ski-lift"
    } else if lift_type.contains("Carpet") {
        "mdi:conveyor-belt"
    } else if lift_type.contains("Poma") || lift_type.contains("Rope") {
        "mdi:ski"
    } else {
        "mdi:chair-rolling"
    }
}

/// Icon hint for a trail, decided by difficulty substring; expert outranks
/// advanced outranks intermediate.
pub fn trail_icon(difficulty: &str) -> &'static str {
    let difficulty = difficulty.to_lowercase();
    if difficulty.contains("expert") {
        "mdi:terrain"
    } else if difficulty.contains("advanced") {
        "mdi:slope-downhill"
    } else if difficulty.contains("intermediate") {
        "mdi:ski"
    } else {
        "mdi:ski-water"
    }
}

/// Resort-wide open-parks count (verbatim from the summary block) plus a flat
/// park-name map merged across every area; a later park under an identical
/// name overwrites the earlier one.
pub fn terrain_parks(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    let open = resortwide_attr(
        doc,
        "numParksOpen",
        "report/currentConditions/resortwide/@numParksOpen",
    )?;
    let mut attributes = AttrMap::new();
    for area in areas(doc) {
        let parks = area
            .get("freestyleTerrain")
            .and_then(|terrain| terrain.get("parks"))
            .and_then(|parks| parks.get("park"));
        for park in as_sequence(parks) {
            let Some(name) = park.attr("name") else { continue };
            attributes.insert(
                name.to_string(),
                json!({
                    "status": attr_or(park, "status", ""),
                    "difficulty": attr_or(park, "difficulty", ""),
                    "groomed": attr_or(park, "groomedOrCut", ""),
                }),
            );
        }
    }
    Ok(EntityState::new(open.to_string(), attributes))
}

/// Resort-wide open-trails count (verbatim) plus `{open, total}` tallies for
/// the five fixed difficulty buckets. Trails with an unrecognized normalized
/// difficulty are left out of the tally.
pub fn trails_by_difficulty(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    let open = resortwide_attr(
        doc,
        "numTrailsOpen",
        "report/currentConditions/resortwide/@numTrailsOpen",
    )?;
    let mut counts: BTreeMap<&str, (u32, u32)> =
        DIFFICULTY_BUCKETS.iter().map(|b| (*b, (0, 0))).collect();
    for area in areas(doc) {
        let trails = area.get("trails").and_then(|t| t.get("trail"));
        for trail in as_sequence(trails) {
            let Some(difficulty) = trail.attr("difficulty") else { continue };
            let normalized = slugify(difficulty);
            if let Some((open_count, total)) = counts.get_mut(normalized.as_str()) {
                *total += 1;
                if status_is_open(trail) {
                    *open_count += 1;
                }
            }
        }
    }
    let mut attributes = AttrMap::new();
    for bucket in DIFFICULTY_BUCKETS {
        let (open_count, total) = counts[bucket];
        attributes.insert(bucket.into(), json!({ "open": open_count, "total": total }));
    }
    Ok(EntityState::new(open.to_string(), attributes))
}

/// Raw tram status plus wait times and the trails it services.
///
/// The tram is the single lift entry of the area named [`TRAM_AREA`]; the
/// entry is read as-is, not normalized as a collection. "Serviced trails"
/// means every trail colocated in that area, an approximation the feed
/// forces. An absent area reads as `"Unknown"` with no attributes.
pub fn tram(doc: &XmlValue) -> EntityState {
    let unknown = || EntityState::new("Unknown".to_string(), AttrMap::new());
    let Some(area) = find_area(doc, TRAM_AREA) else {
        return unknown();
    };
    let Some(lift) = area.get("lifts").and_then(|lifts| lifts.get("lift")) else {
        return unknown();
    };
    let Some(status) = lift.attr("status") else {
        return unknown();
    };

    let trails = area.get("trails").and_then(|t| t.get("trail"));
    let serviced_trails: Vec<_> = as_sequence(trails)
        .into_iter()
        .filter_map(|trail| {
            let name = trail.attr("name")?;
            Some(json!({
                "name": name,
                "status": attr_or(trail, "status", ""),
                "difficulty": attr_or(trail, "difficulty", ""),
                "groomed": attr_or(trail, "groomed", ""),
            }))
        })
        .collect();

    let mut attributes = AttrMap::new();
    attributes.insert("capacity".into(), json!(attr_or(lift, "capacity", "")));
    attributes.insert("type".into(), json!(attr_or(lift, "type", "")));
    attributes.insert(
        "status_detail".into(),
        json!(attr_or(lift, "statusDetail", "")),
    );
    attributes.insert("open_time".into(), json!(attr_or(lift, "openTime", "")));
    attributes.insert("close_time".into(), json!(attr_or(lift, "closeTime", "")));
    attributes.insert(
        "skier_wait_time".into(),
        json!(attr_or(lift, "skierWaitTime", "")),
    );
    attributes.insert(
        "scenic_wait_time".into(),
        json!(attr_or(lift, "scenicWaitTime", "")),
    );
    attributes.insert("serviced_trails".into(), json!(serviced_trails));
    EntityState::new(status.to_string(), attributes)
}

/// Whether any trail currently has snowmaking, from the resort-wide counter.
pub fn snowmaking(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    let pointer = "report/currentConditions/resortwide/@numTrailsSnowMaking";
    let raw = resortwide_attr(doc, "numTrailsSnowMaking", pointer)?;
    let count: i64 = raw.trim().parse().map_err(|_| ProjectError::Conversion {
        pointer,
        value: raw.to_string(),
    })?;
    let mut attributes = AttrMap::new();
    attributes.insert("trails_with_snowmaking".into(), json!(raw));
    Ok(EntityState::new(count > 0, attributes))
}

fn location_measurement(
    doc: &XmlValue,
    attr_name: &str,
    pointer: &'static str,
) -> Result<EntityState, ProjectError> {
    let location = as_sequence(doc.get_path(&[
        "report",
        "currentConditions",
        "resortLocations",
        "location",
    ]))
    .into_iter()
    .next()
    .ok_or(ProjectError::MissingField {
        pointer: "report/currentConditions/resortLocations/location",
    })?;
    let raw = location
        .attr(attr_name)
        .ok_or(ProjectError::MissingField { pointer })?;
    let value: f64 = raw.trim().parse().map_err(|_| ProjectError::Conversion {
        pointer,
        value: raw.to_string(),
    })?;
    Ok(EntityState::new(value, AttrMap::new()))
}

/// Base snow depth in inches at the first reported location.
pub fn snow_depth(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    location_measurement(
        doc,
        "base",
        "report/currentConditions/resortLocations/location/@base",
    )
}

/// Snowfall over the last 24 hours in inches at the first reported location.
pub fn snowfall_24h(doc: &XmlValue) -> Result<EntityState, ProjectError> {
    location_measurement(
        doc,
        "snow24Hours",
        "report/currentConditions/resortLocations/location/@snow24Hours",
    )
}

fn forecast_days(doc: &XmlValue) -> Vec<&XmlValue> {
    as_sequence(doc.get_path(&["report", "forecast", "day"]))
}

/// Map a feed condition string onto the closed canonical vocabulary.
pub fn canonical_condition(raw: &str) -> &'static str {
    match raw {
        "Sunny" => "sunny",
        "Mostly Sunny" | "Partly Sunny" | "Partly Cloudy" => "partlycloudy",
        "Mostly Cloudy" | "Cloudy" => "cloudy",
        "Rain" | "Rain Showers" | "Chance Rain Showers" | "Slight Chance Rain Showers" => "rainy",
        "Snow" | "Snow Showers" | "Chance Snow Showers" => "snowy",
        "Clear" => "clear-night",
        _ => CONDITION_EXCEPTIONAL,
    }
}

/// Today's conditions from the first forecast entry: the high temperature as
/// the value, raw condition and temperatures as attributes. Missing or
/// malformed forecast data reads as no value, never as a failure.
pub fn current_weather(doc: &XmlValue) -> Option<EntityState> {
    let day = forecast_days(doc).into_iter().next()?;
    let high: f64 = day.attr("high")?.trim().parse().ok()?;
    let mut attributes = AttrMap::new();
    attributes.insert("condition".into(), json!(attr_or(day, "weather", "")));
    attributes.insert("high".into(), json!(attr_or(day, "high", "")));
    attributes.insert("low".into(), json!(attr_or(day, "low", "")));
    attributes.insert("details".into(), json!(day.text().unwrap_or("")));
    Some(EntityState::new(high, attributes))
}

/// One canonicalized day of the multi-day forecast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ForecastDay {
    pub date_label: String,
    pub high: f64,
    pub low: f64,
    pub condition: &'static str,
    /// The feed carries no precipitation probability.
    pub probability: Option<f64>,
}

/// The full forecast sequence, or `None` when any day is missing or
/// malformed.
pub fn forecast(doc: &XmlValue) -> Option<Vec<ForecastDay>> {
    let days = forecast_days(doc);
    if days.is_empty() {
        return None;
    }
    let mut out = Vec::with_capacity(days.len());
    for day in days {
        out.push(ForecastDay {
            date_label: day.attr("name")?.to_string(),
            high: day.attr("high")?.trim().parse().ok()?,
            low: day.attr("low")?.trim().parse().ok()?,
            condition: canonical_condition(day.attr("weather")?),
            probability: None,
        });
    }
    Some(out)
}

/// Count of lots whose status is exactly `"open"`, plus per-lot details.
///
/// Known gap preserved from observed behavior: the lot collection must
/// already be a list. A resort reporting a single lot collapses to zero
/// open lots and an empty bundle, and the status comparison is
/// case-sensitive, unlike the lift/trail checks.
pub fn parking(doc: &XmlValue) -> EntityState {
    let lots = doc
        .get_path(&["report", "facilities", "parking", "lot"])
        .and_then(XmlValue::as_list);
    let Some(lots) = lots else {
        return EntityState::new(0.0, AttrMap::new());
    };
    let open = lots
        .iter()
        .filter(|lot| lot.attr("status") == Some("open"))
        .count();
    let mut attributes = AttrMap::new();
    for lot in lots {
        let Some(name) = lot.attr("name") else { continue };
        attributes.insert(
            name.to_string(),
            json!({
                "status": attr_or(lot, "status", ""),
                "percent_full": attr_or(lot, "percentFull", ""),
                "open_time": attr_or(lot, "openTime", ""),
                "closed_time": attr_or(lot, "closedTime", ""),
                "alert": attr_or(lot, "alert", ""),
            }),
        );
    }
    EntityState::new(open as f64, attributes)
}

/// Raw status of the single shuttle line plus its details. An absent line
/// reads as `"Unknown"` with no attributes.
pub fn shuttle(doc: &XmlValue) -> EntityState {
    let line = doc.get_path(&["report", "facilities", "shuttles", "line"]);
    let Some(line) = line else {
        return EntityState::new("Unknown".to_string(), AttrMap::new());
    };
    let Some(status) = line.attr("status") else {
        return EntityState::new("Unknown".to_string(), AttrMap::new());
    };
    let mut attributes = AttrMap::new();
    attributes.insert(
        "number_running".into(),
        json!(attr_or(line, "numberRunning", "")),
    );
    attributes.insert("open_time".into(), json!(attr_or(line, "openTime", "")));
    attributes.insert("closed_time".into(), json!(attr_or(line, "closedTime", "")));
    attributes.insert("comment".into(), json!(attr_or(line, "comment", "")));
    attributes.insert("alert".into(), json!(attr_or(line, "alert", "")));
    EntityState::new(status.to_string(), attributes)
}

/// Which per-element entity families to create alongside the fixed sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub create_lift_entities: bool,
    pub create_trail_entities: bool,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            create_lift_entities: true,
            create_trail_entities: true,
        }
    }
}

/// The fixed resort-level sensors, present regardless of configuration.
pub fn resort_entity_descriptors() -> Vec<EntityDescriptor> {
    vec![
        EntityDescriptor {
            unique_id: "reportpal_resort_open".into(),
            name: "Resort Status".into(),
            kind: EntityKind::ResortStatus,
            device_class: Some(DeviceClass::Running),
            icon: None,
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_snow_making".into(),
            name: "Snow Making".into(),
            kind: EntityKind::Snowmaking,
            device_class: Some(DeviceClass::Running),
            icon: Some("mdi:snowflake".into()),
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_snow_depth".into(),
            name: "Snow Depth".into(),
            kind: EntityKind::SnowDepth,
            device_class: Some(DeviceClass::Distance),
            icon: Some("mdi:ruler".into()),
            unit: Some("in".into()),
        },
        EntityDescriptor {
            unique_id: "reportpal_snowfall_24h".into(),
            name: "24h Snowfall".into(),
            kind: EntityKind::Snowfall24h,
            device_class: Some(DeviceClass::Distance),
            icon: Some("mdi:weather-snowy-heavy".into()),
            unit: Some("in".into()),
        },
        EntityDescriptor {
            unique_id: "reportpal_current_weather".into(),
            name: "Current Weather".into(),
            kind: EntityKind::CurrentWeather,
            device_class: Some(DeviceClass::Temperature),
            icon: Some("mdi:weather-partly-cloudy".into()),
            unit: Some("°F".into()),
        },
        EntityDescriptor {
            unique_id: "reportpal_terrain_parks".into(),
            name: "Terrain Parks".into(),
            kind: EntityKind::TerrainParks,
            device_class: None,
            icon: Some("mdi:snowboard".into()),
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_trails_by_difficulty".into(),
            name: "Trails by Difficulty".into(),
            kind: EntityKind::TrailsByDifficulty,
            device_class: None,
            icon: Some("mdi:ski".into()),
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_tram".into(),
            name: "Tram".into(),
            kind: EntityKind::Tram,
            device_class: None,
            icon: Some("mdi:ski-lift".into()),
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_parking".into(),
            name: "Parking".into(),
            kind: EntityKind::Parking,
            device_class: None,
            icon: Some("mdi:parking".into()),
            unit: None,
        },
        EntityDescriptor {
            unique_id: "reportpal_shuttle".into(),
            name: "Shuttle".into(),
            kind: EntityKind::Shuttle,
            device_class: None,
            icon: Some("mdi:bus".into()),
            unit: None,
        },
    ]
}

/// Enumerate every entity the current document supports: the fixed sensors
/// plus one entity per lift and per trail when the options ask for them.
pub fn discover_entities(doc: &XmlValue, options: DiscoveryOptions) -> Vec<EntityDescriptor> {
    let mut out = resort_entity_descriptors();
    if options.create_lift_entities {
        for area in areas(doc) {
            let Some(area_name) = area.attr("name") else { continue };
            let lifts = area.get("lifts").and_then(|l| l.get("lift"));
            for lift in as_sequence(lifts) {
                let Some(name) = lift.attr("name") else { continue };
                out.push(EntityDescriptor {
                    unique_id: lift_unique_id(name),
                    name: format!("Lift {name}"),
                    kind: EntityKind::Lift {
                        area: area_name.to_string(),
                        name: name.to_string(),
                    },
                    device_class: Some(DeviceClass::Running),
                    icon: Some(lift_icon(attr_or(lift, "type", "")).into()),
                    unit: None,
                });
            }
        }
    }
    if options.create_trail_entities {
        for area in areas(doc) {
            let Some(area_name) = area.attr("name") else { continue };
            let trails = area.get("trails").and_then(|t| t.get("trail"));
            for trail in as_sequence(trails) {
                let Some(name) = trail.attr("name") else { continue };
                out.push(EntityDescriptor {
                    unique_id: trail_unique_id(name),
                    name: format!("Trail {name}"),
                    kind: EntityKind::Trail {
                        area: area_name.to_string(),
                        name: name.to_string(),
                    },
                    device_class: Some(DeviceClass::Running),
                    icon: Some(trail_icon(attr_or(trail, "difficulty", "")).into()),
                    unit: None,
                });
            }
        }
    }
    out
}

/// Resolve a discovered entity to its current state. `Ok(None)` means the
/// entity legitimately has no value right now (weather with no forecast);
/// errors stay scoped to the one entity that needed the missing data.
pub fn entity_state(doc: &XmlValue, kind: &EntityKind) -> Result<Option<EntityState>, ProjectError> {
    match kind {
        EntityKind::ResortStatus => resort_status(doc).map(Some),
        EntityKind::Lift { area, name } => Ok(Some(lift_status(doc, area, name))),
        EntityKind::Trail { area, name } => Ok(Some(trail_status(doc, area, name))),
        EntityKind::TerrainParks => terrain_parks(doc).map(Some),
        EntityKind::TrailsByDifficulty => trails_by_difficulty(doc).map(Some),
        EntityKind::Tram => Ok(Some(tram(doc))),
        EntityKind::Snowmaking => snowmaking(doc).map(Some),
        EntityKind::SnowDepth => snow_depth(doc).map(Some),
        EntityKind::Snowfall24h => snowfall_24h(doc).map(Some),
        EntityKind::CurrentWeather => Ok(current_weather(doc)),
        EntityKind::Parking => Ok(Some(parking(doc))),
        EntityKind::Shuttle => Ok(Some(shuttle(doc))),
    }
}
