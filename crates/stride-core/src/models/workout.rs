use std::collections::BTreeMap;

use nostr_sdk::Event;
use serde::{Deserialize, Serialize};

use crate::constants::{kinds, SECS_PER_DAY};
use crate::error::ParseError;

/// A number with its unit, e.g. `5.2 km`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measure {
    pub value: f64,
    pub unit: String,
}

/// One split/lap marker. Elapsed time is cumulative from the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Split {
    pub elapsed_secs: u64,
    pub distance: Option<f64>,
}

/// Workout record - kind:1301 events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkoutRecord {
    pub id: String,
    pub pubkey: String,
    pub exercise: String,
    pub duration_secs: u64,
    pub distance: Option<Measure>,
    pub elevation_gain: Option<Measure>,
    pub calories: Option<u32>,
    /// Keyed by split number
    pub splits: BTreeMap<u32, Split>,
    pub team: Option<String>,
    pub hashtags: Vec<String>,
    pub content: String,
    pub created_at: u64,
}

impl WorkoutRecord {
    /// Parse a WorkoutRecord from a kind:1301 event
    pub fn from_event(event: &Event) -> Result<Self, ParseError> {
        let kind = event.kind.as_u16();
        if kind != kinds::WORKOUT_RECORD {
            return Err(ParseError::WrongKind {
                expected: kinds::WORKOUT_RECORD,
                found: kind,
            });
        }

        let mut exercise: Option<String> = None;
        let mut duration_secs: Option<u64> = None;
        let mut distance: Option<Measure> = None;
        let mut elevation_gain: Option<Measure> = None;
        let mut calories: Option<u32> = None;
        let mut splits = BTreeMap::new();
        let mut team: Option<String> = None;
        let mut hashtags = Vec::new();

        for tag in event.tags.iter() {
            let parts = tag.as_slice();
            let (Some(name), Some(value)) = (parts.first(), parts.get(1)) else {
                continue;
            };
            match name.as_str() {
                "exercise" if !value.trim().is_empty() => {
                    exercise = Some(value.trim().to_lowercase());
                }
                "duration" => duration_secs = Some(parse_duration("duration", value)?),
                "distance" => distance = Some(parse_measure("distance", value, parts.get(2), "km")?),
                "elevation_gain" => {
                    elevation_gain = Some(parse_measure("elevation_gain", value, parts.get(2), "m")?)
                }
                "calories" => {
                    let parsed = value.trim().parse::<f64>().ok().filter(|c| is_amount(*c));
                    match parsed {
                        Some(c) => calories = Some(c.round() as u32),
                        None => return Err(invalid("calories", value)),
                    }
                }
                "split" => {
                    let number: u32 = value.trim().parse().map_err(|_| invalid("split", value))?;
                    let elapsed = parts
                        .get(2)
                        .ok_or(ParseError::MissingField("split elapsed"))?;
                    let split_distance = match parts.get(3) {
                        Some(d) if !d.trim().is_empty() => {
                            let parsed = d.trim().parse::<f64>().ok().filter(|v| is_amount(*v));
                            Some(parsed.ok_or_else(|| invalid("split", d))?)
                        }
                        _ => None,
                    };
                    splits.insert(
                        number,
                        Split {
                            elapsed_secs: parse_duration("split", elapsed)?,
                            distance: split_distance,
                        },
                    );
                }
                "team" if !value.is_empty() => team = Some(value.clone()),
                "t" if !value.is_empty() => hashtags.push(value.to_lowercase()),
                _ => {}
            }
        }

        Ok(WorkoutRecord {
            id: event.id.to_hex(),
            pubkey: event.pubkey.to_hex(),
            exercise: exercise.ok_or(ParseError::MissingField("exercise"))?,
            duration_secs: duration_secs.ok_or(ParseError::MissingField("duration"))?,
            distance,
            elevation_gain,
            calories,
            splits,
            team,
            hashtags,
            content: event.content.clone(),
            created_at: event.created_at.as_secs(),
        })
    }

    /// UTC day number, used as the time-bucket index key.
    pub fn day_bucket(&self) -> u64 {
        self.created_at / SECS_PER_DAY
    }

    /// Seconds per unit of distance, when distance is known and non-zero.
    pub fn pace_secs(&self) -> Option<f64> {
        let distance = self.distance.as_ref()?;
        (distance.value > 0.0).then(|| self.duration_secs as f64 / distance.value)
    }
}

/// The `team` tag of any event, without a full parse.
pub fn group_of(event: &Event) -> Option<&str> {
    event.tags.iter().find_map(|tag| match tag.as_slice() {
        [name, value, ..] if name == "team" && !value.is_empty() => Some(value.as_str()),
        _ => None,
    })
}

fn invalid(field: &'static str, value: &str) -> ParseError {
    ParseError::InvalidField {
        field,
        value: value.to_string(),
    }
}

/// Accepts `HH:MM:SS`, `MM:SS` or plain seconds.
fn parse_duration(field: &'static str, value: &str) -> Result<u64, ParseError> {
    let trimmed = value.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(invalid(field, value));
    }
    let mut total: u64 = 0;
    for (i, part) in parts.iter().enumerate() {
        let n: u64 = part.parse().map_err(|_| invalid(field, value))?;
        // Minutes and seconds after the first component must stay below 60
        if i > 0 && n >= 60 {
            return Err(invalid(field, value));
        }
        total = total
            .checked_mul(60)
            .and_then(|t| t.checked_add(n))
            .ok_or_else(|| invalid(field, value))?;
    }
    Ok(total)
}

/// Finite and non-negative; NaN and infinity do not survive a JSON snapshot.
fn is_amount(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

fn parse_measure(
    field: &'static str,
    value: &str,
    unit: Option<&String>,
    default_unit: &str,
) -> Result<Measure, ParseError> {
    let parsed: f64 = value.trim().parse().map_err(|_| invalid(field, value))?;
    if !is_amount(parsed) {
        return Err(invalid(field, value));
    }
    let unit = unit
        .map(|u| u.trim().to_lowercase())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| default_unit.to_string());
    Ok(Measure {
        value: parsed,
        unit,
    })
}
