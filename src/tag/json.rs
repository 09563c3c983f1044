//! Versioned JSON encoding of checkpoint tags.
//!
//! Tags are written as compact objects with short keys: `$c`/`$p` for the
//! commit and prepare positions, `$s` for stream positions (a map, or a
//! two-element array for by-stream tags marked with `$m: "bs"`), `$ph` for a
//! non-zero phase, `$cp` for phase tags and `$v` for the
//! `projectionId:epoch:version:systemVersion` stamp. Decoding also accepts
//! the legacy long spellings and keeps unknown keys untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{CheckpointTag, Locator, NO_STREAM, TfPos};
use crate::error::TagError;

/// Version of the projections subsystem stamped into every written tag.
pub const PROJECTIONS_SYSTEM_VERSION: i32 = 4;

const BY_STREAM_MODE: &str = "bs";

// (short, legacy) spellings of every recognized key.
const VERSION: (&str, &str) = ("$v", "v");
const PHASE: (&str, &str) = ("$ph", "phase");
const COMMIT: (&str, &str) = ("$c", "commitPosition");
const PREPARE: (&str, &str) = ("$p", "preparePosition");
const STREAMS: (&str, &str) = ("$s", "streams");
const MODE: (&str, &str) = ("$m", "mode");
const COMPLETED: (&str, &str) = ("$cp", "completed");

const RESERVED: [(&str, &str); 7] = [VERSION, PHASE, COMMIT, PREPARE, STREAMS, MODE, COMPLETED];

/// Identity and generation of a projection definition.
///
/// `epoch` is raised whenever the projection is reset; checkpoints written
/// under an older epoch are ignored on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProjectionVersion {
    /// Identifier of the projection definition.
    pub projection_id: i64,
    /// Reset generation.
    pub epoch: i64,
    /// Definition version.
    pub version: i64,
}

impl ProjectionVersion {
    /// Create a version stamp.
    pub const fn new(projection_id: i64, epoch: i64, version: i64) -> Self {
        Self {
            projection_id,
            epoch,
            version,
        }
    }
}

/// A decoded tag together with the version stamp and the keys the decoder
/// did not recognize.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointTagVersion {
    /// The decoded tag.
    pub tag: CheckpointTag,
    /// Projection version the tag was written under.
    pub version: ProjectionVersion,
    /// Projections subsystem version the tag was written by (0 if absent).
    pub system_version: i32,
    /// Unrecognized keys, preserved as found.
    pub extra: Map<String, Value>,
}

fn is_reserved(key: &str) -> bool {
    RESERVED
        .iter()
        .any(|(short, long)| *short == key || *long == key)
}

fn take(object: &mut Map<String, Value>, (short, long): (&str, &str)) -> Option<Value> {
    let short_value = object.remove(short);
    let long_value = object.remove(long);
    short_value.or(long_value)
}

fn as_i64(value: &Value, key: &str) -> Result<i64, TagError> {
    value
        .as_i64()
        .ok_or_else(|| TagError::InvalidTag(format!("`{key}` must be an integer, was {value}")))
}

fn parse_streams(value: &Value) -> Result<Vec<(String, i64)>, TagError> {
    let Value::Object(streams) = value else {
        return Err(TagError::InvalidTag(format!(
            "stream positions must be an object, was {value}"
        )));
    };
    streams
        .iter()
        .map(|(name, seq)| Ok((name.clone(), as_i64(seq, name)?)))
        .collect()
}

fn parse_single_entry(value: &Value) -> Result<(String, i64), TagError> {
    match value {
        Value::Object(entry) if entry.len() == 1 => {
            let (name, seq) = entry
                .iter()
                .next()
                .ok_or_else(|| TagError::InvalidTag("empty by-stream entry".into()))?;
            Ok((name.clone(), as_i64(seq, name)?))
        }
        other => Err(TagError::InvalidTag(format!(
            "by-stream entry must be a single-key object, was {other}"
        ))),
    }
}

fn parse_version(value: Option<Value>) -> Result<(ProjectionVersion, i32), TagError> {
    let value = match value {
        None => return Ok((ProjectionVersion::default(), 0)),
        Some(Value::Number(n)) => {
            let version = n
                .as_i64()
                .ok_or_else(|| TagError::InvalidTag(format!("invalid version {n}")))?;
            return Ok((ProjectionVersion::new(0, 0, version), 0));
        }
        Some(Value::String(s)) => s,
        Some(other) => {
            return Err(TagError::InvalidTag(format!("invalid version {other}")));
        }
    };
    let parts = value
        .split(':')
        .map(|part| part.parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TagError::InvalidTag(format!("invalid version `{value}`")))?;
    match parts.as_slice() {
        [version] => Ok((ProjectionVersion::new(0, 0, *version), 0)),
        [id, epoch, version] => Ok((ProjectionVersion::new(*id, *epoch, *version), 0)),
        [id, epoch, version, system] => {
            let system = i32::try_from(*system)
                .map_err(|_| TagError::InvalidTag(format!("invalid version `{value}`")))?;
            Ok((ProjectionVersion::new(*id, *epoch, *version), system))
        }
        _ => Err(TagError::InvalidTag(format!("invalid version `{value}`"))),
    }
}

impl CheckpointTag {
    /// Encode the tag as a JSON object.
    ///
    /// # Arguments
    ///
    /// * `version` - Version stamp to write as `$v`, if any.
    /// * `extra` - Additional keys to include. Keys colliding with a reserved
    ///   tag key are skipped.
    pub fn to_json_value(
        &self,
        version: Option<&ProjectionVersion>,
        extra: &Map<String, Value>,
    ) -> Value {
        let mut object = Map::new();
        if let Some(v) = version {
            object.insert(
                VERSION.0.into(),
                Value::String(format!(
                    "{}:{}:{}:{}",
                    v.projection_id, v.epoch, v.version, PROJECTIONS_SYSTEM_VERSION
                )),
            );
        }
        if self.phase != 0 {
            object.insert(PHASE.0.into(), json!(self.phase));
        }
        match &self.locator {
            Locator::Phase { completed } => {
                object.insert(COMPLETED.0.into(), json!(completed));
            }
            Locator::Position(position) => {
                object.insert(COMMIT.0.into(), json!(position.commit));
                object.insert(PREPARE.0.into(), json!(position.prepare));
            }
            Locator::PreparePosition(prepare) => {
                object.insert(PREPARE.0.into(), json!(prepare));
            }
            Locator::Stream { stream, sequence } => {
                object.insert(STREAMS.0.into(), json!({ stream: sequence }));
            }
            Locator::MultiStream(streams) => {
                object.insert(STREAMS.0.into(), json!(streams));
            }
            Locator::EventTypeIndex {
                position,
                event_types,
            } => {
                object.insert(COMMIT.0.into(), json!(position.commit));
                object.insert(PREPARE.0.into(), json!(position.prepare));
                object.insert(STREAMS.0.into(), json!(event_types));
            }
            Locator::ByStream(by) => {
                object.insert(MODE.0.into(), json!(BY_STREAM_MODE));
                if let Some(commit) = by.commit_position {
                    object.insert(COMMIT.0.into(), json!(commit));
                }
                let mut entries = vec![json!({ by.catalog_stream.clone(): by.catalog_position })];
                if let Some(data) = &by.data_stream {
                    entries.push(json!({ data.clone(): by.data_position }));
                }
                object.insert(STREAMS.0.into(), Value::Array(entries));
            }
        }
        for (key, value) in extra {
            if !is_reserved(key) {
                object.insert(key.clone(), value.clone());
            }
        }
        Value::Object(object)
    }

    /// Encode the tag without a version stamp or extra keys.
    pub fn to_json_string(&self) -> String {
        self.to_json_value(None, &Map::new()).to_string()
    }

    /// Encode the tag with a version stamp and extra keys.
    pub fn to_json_string_with(
        &self,
        version: &ProjectionVersion,
        extra: &Map<String, Value>,
    ) -> String {
        self.to_json_value(Some(version), extra).to_string()
    }

    /// Decode a tag written by [`to_json_string`](Self::to_json_string) or by
    /// an older writer using the long key spellings.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::Json`] for text that is not JSON and
    /// [`TagError::InvalidTag`] for objects that do not describe a tag.
    pub fn from_json(json: &str) -> Result<CheckpointTagVersion, TagError> {
        Self::from_json_value(serde_json::from_str(json)?)
    }

    /// Decode a tag from an already parsed JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`TagError::InvalidTag`] for values that do not describe a tag.
    pub fn from_json_value(value: Value) -> Result<CheckpointTagVersion, TagError> {
        let Value::Object(mut object) = value else {
            return Err(TagError::InvalidTag(format!(
                "checkpoint tag must be a JSON object, was {value}"
            )));
        };
        let (version, system_version) = parse_version(take(&mut object, VERSION))?;
        let phase = match take(&mut object, PHASE) {
            Some(value) => i32::try_from(as_i64(&value, PHASE.0)?)
                .map_err(|_| TagError::InvalidTag(format!("phase out of range: {value}")))?,
            None => 0,
        };
        let commit = take(&mut object, COMMIT)
            .map(|v| as_i64(&v, COMMIT.0))
            .transpose()?;
        let prepare = take(&mut object, PREPARE)
            .map(|v| as_i64(&v, PREPARE.0))
            .transpose()?;
        let streams = take(&mut object, STREAMS);
        let mode = take(&mut object, MODE);
        let completed = take(&mut object, COMPLETED);

        let tag = if let Some(mode) = mode {
            if mode.as_str() != Some(BY_STREAM_MODE) {
                return Err(TagError::InvalidTag(format!("unknown tag mode {mode}")));
            }
            let Some(Value::Array(entries)) = streams else {
                return Err(TagError::InvalidTag(
                    "by-stream tag requires a stream position array".into(),
                ));
            };
            let (catalog, catalog_position) = entries
                .first()
                .ok_or_else(|| TagError::InvalidTag("by-stream tag without catalog".into()))
                .and_then(parse_single_entry)?;
            let data = entries.get(1).map(parse_single_entry).transpose()?;
            if entries.len() > 2 {
                return Err(TagError::InvalidTag(
                    "by-stream tag has more than two positions".into(),
                ));
            }
            let (data_stream, data_position) = match data {
                Some((stream, position)) => (Some(stream), position),
                None => (None, NO_STREAM),
            };
            CheckpointTag::from_by_stream_position(
                phase,
                catalog,
                catalog_position,
                data_stream,
                data_position,
                commit,
            )?
        } else if let Some(completed) = completed {
            let completed = completed
                .as_bool()
                .ok_or_else(|| TagError::InvalidTag(format!("invalid completed flag {completed}")))?;
            CheckpointTag::from_phase(phase, completed)
        } else {
            match (commit, prepare, streams) {
                (Some(commit), Some(prepare), Some(streams)) => {
                    CheckpointTag::from_event_type_index_positions(
                        phase,
                        TfPos::new(commit, prepare),
                        parse_streams(&streams)?,
                    )?
                }
                (Some(commit), Some(prepare), None) => {
                    CheckpointTag::from_position(phase, TfPos::new(commit, prepare))?
                }
                (None, Some(prepare), None) => CheckpointTag::from_prepare_position(phase, prepare)?,
                (None, None, Some(streams)) => {
                    CheckpointTag::from_stream_positions(phase, parse_streams(&streams)?)?
                }
                _ => {
                    return Err(TagError::InvalidTag(
                        "object does not describe a checkpoint tag".into(),
                    ));
                }
            }
        };

        Ok(CheckpointTagVersion {
            tag,
            version,
            system_version,
            extra: object,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tag::TagMode;

    fn every_mode() -> Vec<CheckpointTag> {
        vec![
            CheckpointTag::from_phase(3, true),
            CheckpointTag::from_phase(0, false),
            CheckpointTag::from_position(0, TfPos::new(1200, 1100)).expect("valid"),
            CheckpointTag::from_prepare_position(1, 77).expect("valid"),
            CheckpointTag::from_stream_position(0, "orders", 12).expect("valid"),
            CheckpointTag::from_stream_positions(
                2,
                [("a".to_owned(), 1), ("b".to_owned(), -1)],
            )
            .expect("valid"),
            CheckpointTag::from_event_type_index_positions(
                0,
                TfPos::new(500, 450),
                [("OrderPlaced".to_owned(), 3)],
            )
            .expect("valid"),
            CheckpointTag::from_by_stream_position(
                1,
                "catalog",
                4,
                Some("data-4".into()),
                9,
                Some(880),
            )
            .expect("valid"),
            CheckpointTag::from_by_stream_position(0, "catalog", 0, None, -1, None)
                .expect("valid"),
        ]
    }

    #[test]
    fn every_mode_round_trips_with_phase_and_extra_keys() {
        let version = ProjectionVersion::new(7, 2, 3);
        let mut extra = Map::new();
        extra.insert("$correlationId".into(), json!("abc"));
        extra.insert("custom".into(), json!({"nested": [1, 2]}));

        for tag in every_mode() {
            let text = tag.to_json_string_with(&version, &extra);
            let decoded = CheckpointTag::from_json(&text).expect("decodes");
            assert_eq!(decoded.tag, tag, "tag {tag} from {text}");
            assert_eq!(decoded.tag.mode(), tag.mode());
            assert_eq!(decoded.tag.phase(), tag.phase());
            assert_eq!(decoded.version, version);
            assert_eq!(decoded.system_version, PROJECTIONS_SYSTEM_VERSION);
            assert_eq!(decoded.extra, extra);
        }
    }

    #[test]
    fn short_keys_are_written() {
        let tag = CheckpointTag::from_position(2, TfPos::new(10, 5)).expect("valid");
        let value = tag.to_json_value(None, &Map::new());
        assert_eq!(value, json!({"$ph": 2, "$c": 10, "$p": 5}));
    }

    #[test]
    fn zero_phase_is_omitted() {
        let tag = CheckpointTag::from_stream_position(0, "s", 1).expect("valid");
        assert_eq!(tag.to_json_string(), r#"{"$s":{"s":1}}"#);
    }

    #[test]
    fn legacy_long_keys_are_accepted() {
        let decoded =
            CheckpointTag::from_json(r#"{"commitPosition": 30, "preparePosition": 20, "v": 5}"#)
                .expect("decodes");
        assert_eq!(decoded.tag.mode(), TagMode::Position);
        assert_eq!(decoded.tag.position(), Some(TfPos::new(30, 20)));
        assert_eq!(decoded.version.version, 5);

        let decoded = CheckpointTag::from_json(r#"{"streams": {"a": 1, "b": 2}, "phase": 1}"#)
            .expect("decodes");
        assert_eq!(decoded.tag.mode(), TagMode::MultiStream);
        assert_eq!(decoded.tag.phase(), 1);
    }

    #[test]
    fn extra_keys_cannot_shadow_tag_keys() {
        let tag = CheckpointTag::from_prepare_position(0, 4).expect("valid");
        let mut extra = Map::new();
        extra.insert("streams".into(), json!({"x": 1}));
        extra.insert("$p".into(), json!(999));
        let decoded = CheckpointTag::from_json(&tag.to_json_string_with(
            &ProjectionVersion::default(),
            &extra,
        ))
        .expect("decodes");
        assert_eq!(decoded.tag, tag);
        assert!(decoded.extra.is_empty());
    }

    #[test]
    fn three_part_version_has_no_system_version() {
        let decoded = CheckpointTag::from_json(r#"{"$v": "1:2:3", "$p": 0}"#).expect("decodes");
        assert_eq!(decoded.version, ProjectionVersion::new(1, 2, 3));
        assert_eq!(decoded.system_version, 0);
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(matches!(
            CheckpointTag::from_json("not json"),
            Err(TagError::Json(_))
        ));
        assert!(matches!(
            CheckpointTag::from_json("[1, 2]"),
            Err(TagError::InvalidTag(_))
        ));
        assert!(CheckpointTag::from_json("{}").is_err());
        assert!(CheckpointTag::from_json(r#"{"$s": {}}"#).is_err());
        assert!(CheckpointTag::from_json(r#"{"$v": "a:b", "$p": 0}"#).is_err());
        assert!(CheckpointTag::from_json(r#"{"$m": "bs", "$s": {"a": 1}}"#).is_err());
    }
}
